mod aggregate;
mod classify;
mod clock;
mod crawl;
mod error;
mod inputs;
mod places;
mod settings;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::aggregate::PlaceFilter;
use crate::classify::{CategoryTable, Classifier};
use crate::clock::{Clock, TokioClock};
use crate::crawl::Crawler;
use crate::places::{normalize, HttpPageFetcher, PaginatedSearch, SearchClient};
use crate::settings::Settings;
use crate::sink::{CsvSink, TableLayout};

const DEFAULT_OUTPUT: &str = "data/places.csv";

#[derive(Parser)]
#[command(name = "bio_scraper", about = "Organic and local food directory builder via Google Places")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every keyword in every area and append new places to the table
    Crawl(CrawlArgs),
    /// Run a single paginated search and print the normalized hits
    Search {
        /// Free-text query, e.g. "magasin bio in Namur"
        query: String,
        /// Max hits to print
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Summarize an existing table
    Stats {
        #[arg(short, long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },
}

#[derive(Args)]
struct CrawlArgs {
    /// Area list, one per line (# comments allowed)
    #[arg(short, long, default_value = "cities.txt")]
    areas: PathBuf,
    /// Keyword list, one per line (# comments allowed)
    #[arg(short, long, default_value = "keywords.txt")]
    keywords: PathBuf,
    /// keyword,category lines mapping keywords to a place category
    #[arg(long)]
    place_categories: Option<PathBuf>,
    /// keyword,category lines mapping keywords to a product category
    #[arg(long)]
    product_categories: Option<PathBuf>,
    /// Output CSV, appended to across runs
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,
    #[arg(long, value_enum, default_value = "tagged")]
    layout: TableLayout,
    /// Keep only farms and producers
    #[arg(long)]
    producers_only: bool,
    /// Disable the default courthouse/government exclusions
    #[arg(long)]
    keep_all: bool,
    /// Extra upstream type to exclude (repeatable)
    #[arg(long = "exclude-type")]
    exclude_types: Vec<String>,
    /// Extra name substring to exclude (repeatable)
    #[arg(long = "exclude-name")]
    exclude_names: Vec<String>,
}

impl CrawlArgs {
    fn filter(&self) -> PlaceFilter {
        let base = if self.keep_all {
            PlaceFilter::permissive()
        } else {
            PlaceFilter::standard()
        };
        let filter = base
            .exclude_types(self.exclude_types.iter().map(String::as_str))
            .exclude_name_terms(self.exclude_names.iter().map(String::as_str));
        if self.producers_only {
            filter.producers_only()
        } else {
            filter
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {}", path.display());
    }

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Crawl(args) => run_crawl(args).await,
        Commands::Search { query, limit } => {
            let settings = Settings::load()?;
            let client = build_client(&settings)?;
            let hits = client.search(&query).await?;
            println!("{} hits for '{}'", hits.len(), query);
            for (i, raw) in hits.iter().take(limit).enumerate() {
                let r = normalize(raw);
                println!(
                    "{:>3} | {:<32} | {:<6} | {:<20} | {}",
                    i + 1,
                    truncate(&r.name, 32),
                    r.postal_code,
                    truncate(&r.city, 20),
                    r.url()
                );
            }
            Ok(())
        }
        Commands::Stats { output } => {
            let stats = sink::table_stats(&output)?;
            println!("Rows:   {}", stats.rows);
            println!("Cities: {}", stats.cities.len());
            for (city, n) in stats.top_cities(15) {
                println!("  {:<24} {:>5}", truncate(city, 24), n);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_crawl(args: CrawlArgs) -> anyhow::Result<()> {
    // Everything that can fail on configuration is checked before the first request.
    let settings = Settings::load()?;
    settings.require_api_key()?;
    let areas = inputs::read_list(&args.areas)?;
    let keywords = inputs::read_list(&args.keywords)?;
    let place_table = load_optional_mapping(args.place_categories.as_deref())?;
    let product_table = load_optional_mapping(args.product_categories.as_deref())?;
    let classifier = Classifier::new(place_table, product_table);
    let filter = args.filter();
    let mut sink = CsvSink::open(&args.output, args.layout)?;

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let client = PaginatedSearch::new(HttpPageFetcher::new(&settings)?, clock.clone(), &settings);
    let crawler = Crawler::new(&client, &classifier, &filter, clock, &settings);

    println!(
        "Crawling {} areas x {} keywords ({} searches) into {}",
        areas.len(),
        keywords.len(),
        areas.len() * keywords.len(),
        sink.path().display()
    );
    let s = crawler.run(&areas, &keywords, &mut sink).await?;

    println!(
        "Done: {} areas, {} searches ({} failed), {} hits.",
        s.areas, s.searches, s.failed_searches, s.hits
    );
    println!(
        "{} area entries ({} filtered, {} without id): {} new rows, {} already recorded. Table now holds {}.",
        s.area_entries, s.filtered, s.missing_id, s.written, s.already_known, sink.len()
    );
    Ok(())
}

fn build_client(settings: &Settings) -> anyhow::Result<PaginatedSearch<HttpPageFetcher>> {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    Ok(PaginatedSearch::new(HttpPageFetcher::new(settings)?, clock, settings))
}

fn load_optional_mapping(path: Option<&std::path::Path>) -> anyhow::Result<CategoryTable> {
    match path {
        Some(p) => Ok(inputs::load_mapping(p)?),
        None => Ok(CategoryTable::new()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
