use std::path::Path;

use tracing::{info, warn};

use crate::classify::CategoryTable;
use crate::error::{CrawlError, Result};

/// Non-empty lines of a list file, `#` comments skipped.
pub fn read_list(path: &Path) -> Result<Vec<String>> {
    let text = read_required(path)?;
    let items = parse_list(&text);
    if items.is_empty() {
        return Err(CrawlError::Config(format!("{} contains no entries", path.display())));
    }
    Ok(items)
}

pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Load a `keyword,category` mapping file. Malformed lines are logged and skipped.
pub fn load_mapping(path: &Path) -> Result<CategoryTable> {
    let text = read_required(path)?;
    let source_name = path.display().to_string();
    let (table, errors) = parse_mapping(&text, &source_name);
    for err in &errors {
        warn!("Skipping mapping line: {}", err);
    }
    info!("Loaded {} mappings from {} ({} skipped)", table.len(), source_name, errors.len());
    Ok(table)
}

pub fn parse_mapping(text: &str, source_name: &str) -> (CategoryTable, Vec<CrawlError>) {
    let mut table = CategoryTable::new();
    let mut errors = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let data_error = |reason: &str| CrawlError::Data {
            source_name: source_name.to_string(),
            line: idx + 1,
            reason: reason.to_string(),
        };
        match line.split_once(',') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                table.insert(key, value);
            }
            Some(_) => errors.push(data_error("empty keyword or category")),
            None => errors.push(data_error("expected `keyword,category`")),
        }
    }

    (table, errors)
}

fn read_required(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CrawlError::Config(format!("cannot read {}: {}", path.display(), e)))
}
