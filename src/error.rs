use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Error)]
pub enum CrawlError {
    /// Missing credential, missing input file or invalid settings. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// Transport failure or timeout talking to the upstream API.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Non-2xx response, malformed body, or an API-level error status.
    #[error("upstream error ({}): {message}", describe_status(.status, .api_status))]
    Upstream {
        status: Option<u16>,
        api_status: Option<String>,
        message: String,
    },

    /// Malformed line in an input file. Callers log and skip these.
    #[error("{source_name}:{line}: {reason}")]
    Data {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl CrawlError {
    pub fn upstream(status: Option<u16>, api_status: Option<&str>, message: impl Into<String>) -> Self {
        CrawlError::Upstream {
            status,
            api_status: api_status.map(str::to_string),
            message: message.into(),
        }
    }

    /// Whether a caller may retry the same request after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::TransientNetwork(_) => true,
            CrawlError::Upstream {
                status, api_status, ..
            } => {
                let http_retry = matches!(status, Some(s) if *s == 429 || (500..600).contains(s));
                let api_retry = matches!(
                    api_status.as_deref(),
                    Some("OVER_QUERY_LIMIT") | Some("UNKNOWN_ERROR")
                );
                http_retry || api_retry
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => CrawlError::upstream(Some(status.as_u16()), None, err.to_string()),
            None => CrawlError::TransientNetwork(err.to_string()),
        }
    }
}

fn describe_status(status: &Option<u16>, api_status: &Option<String>) -> String {
    match (status, api_status) {
        (Some(s), Some(a)) => format!("HTTP {}, {}", s, a),
        (Some(s), None) => format!("HTTP {}", s),
        (None, Some(a)) => a.to_string(),
        (None, None) => "no status".to_string(),
    }
}
