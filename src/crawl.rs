use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::aggregate::{AreaAggregator, Observation, PlaceFilter};
use crate::classify::Classifier;
use crate::clock::{Clock, Throttle};
use crate::error::Result;
use crate::places::{normalize, RawPlace, SearchClient};
use crate::settings::Settings;
use crate::sink::CsvSink;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_backoff: settings.backoff(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// Totals reported at the end of a crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub areas: usize,
    pub searches: usize,
    pub failed_searches: usize,
    pub hits: usize,
    pub missing_id: usize,
    pub filtered: usize,
    /// Entries drained per area, summed. A place found in two areas counts twice.
    pub area_entries: usize,
    pub written: usize,
    pub already_known: usize,
}

/// Drives the area × keyword matrix: search, normalize, classify, aggregate,
/// then flush each area to the sink as soon as its last keyword is done.
pub struct Crawler<'a, C: SearchClient> {
    client: &'a C,
    classifier: &'a Classifier,
    filter: &'a PlaceFilter,
    clock: Arc<dyn Clock>,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl<'a, C: SearchClient> Crawler<'a, C> {
    pub fn new(
        client: &'a C,
        classifier: &'a Classifier,
        filter: &'a PlaceFilter,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        Self {
            client,
            classifier,
            filter,
            throttle: Throttle::new(clock.clone(), settings.keyword_delay()),
            clock,
            retry: RetryPolicy::from_settings(settings),
        }
    }

    pub async fn run(&self, areas: &[String], keywords: &[String], sink: &mut CsvSink) -> Result<CrawlSummary> {
        let total = (areas.len() * keywords.len()) as u64;
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let mut summary = CrawlSummary::default();

        for area in areas {
            info!("Crawling area {}", area);
            let mut agg = AreaAggregator::new(area, self.filter);

            for keyword in keywords {
                pb.set_message(format!("{} / {}", area, keyword));
                let query = format!("{} in {}", keyword, area);
                summary.searches += 1;

                match self.search_with_retry(&query).await {
                    Ok(hits) => self.merge_hits(&mut agg, keyword, hits, &mut summary),
                    Err(e) => {
                        summary.failed_searches += 1;
                        warn!("Search '{}' failed, moving on: {}", query, e);
                    }
                }
                pb.inc(1);
            }

            let entries = agg.drain();
            summary.area_entries += entries.len();
            let report = sink.flush(area, entries)?;
            summary.written += report.written;
            summary.already_known += report.skipped;
            summary.areas += 1;
            info!(
                "Area {} done: {} new rows, {} already recorded",
                area, report.written, report.skipped
            );
        }

        pb.finish_and_clear();
        Ok(summary)
    }

    fn merge_hits(&self, agg: &mut AreaAggregator<'_>, keyword: &str, hits: Vec<RawPlace>, summary: &mut CrawlSummary) {
        let categories = self.classifier.classify(keyword);
        for raw in &hits {
            summary.hits += 1;
            let record = normalize(raw);
            if record.id.is_empty() {
                summary.missing_id += 1;
                continue;
            }
            if agg.observe(record, keyword, &categories) == Observation::Filtered {
                summary.filtered += 1;
            }
        }
    }

    /// One search, paced by the keyword throttle and retried with exponential
    /// backoff on retryable errors. The keyword delay runs from the end of the
    /// previous attempt, however long that attempt took.
    async fn search_with_retry(&self, query: &str) -> Result<Vec<RawPlace>> {
        let mut attempt = 0;
        loop {
            self.throttle.ready().await;
            let outcome = self.client.search(query).await;
            self.throttle.done().await;
            match outcome {
                Ok(hits) => return Ok(hits),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "Search '{}' failed (attempt {}/{}), backing off {:.1}s: {}",
                        query,
                        attempt + 1,
                        self.retry.max_retries,
                        backoff.as_secs_f64(),
                        e
                    );
                    self.clock.sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
