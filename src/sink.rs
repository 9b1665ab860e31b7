use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::aggregate::AggregationEntry;
use crate::error::{CrawlError, Result};
use crate::places::normalize::place_id_from_url;

const BASIC_COLUMNS: &[&str] = &[
    "name",
    "address",
    "city",
    "postal_code",
    "rating",
    "review_count",
    "types",
    "maps_url",
];

const TAGGED_COLUMNS: &[&str] = &[
    "name",
    "address",
    "city",
    "postal_code",
    "rating",
    "review_count",
    "types",
    "maps_url",
    "matched_keywords",
    "place_category",
    "product_category",
];

const URL_COLUMN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableLayout {
    /// Place columns only.
    Basic,
    /// Place columns plus matched keywords and categories.
    Tagged,
}

impl TableLayout {
    pub fn header(&self) -> &'static [&'static str] {
        match self {
            TableLayout::Basic => BASIC_COLUMNS,
            TableLayout::Tagged => TAGGED_COLUMNS,
        }
    }

    fn row(&self, entry: &AggregationEntry) -> Vec<String> {
        let r = &entry.record;
        let mut row = vec![
            r.name.clone(),
            r.address.clone(),
            r.city.clone(),
            r.postal_code.clone(),
            r.rating.map(|v| v.to_string()).unwrap_or_default(),
            r.review_count.map(|v| v.to_string()).unwrap_or_default(),
            r.types.join("|"),
            r.url(),
        ];
        if *self == TableLayout::Tagged {
            row.push(join_set(&entry.keywords));
            row.push(join_set(&entry.place_categories));
            row.push(join_set(&entry.product_categories));
        }
        row
    }
}

fn join_set(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(";")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub skipped: usize,
}

/// Append-only CSV table keyed by place identifier.
///
/// Identifiers already in the file are loaded at open time and never written
/// again. Each `flush` appends one area's new rows in a single write; if that
/// write fails the file is truncated back to its previous length, so an area
/// is either fully present or absent. A row left half-written by a killed
/// process is cut off the next time the table is opened.
pub struct CsvSink {
    path: PathBuf,
    layout: TableLayout,
    seen: HashSet<String>,
}

impl CsvSink {
    pub fn open(path: &Path, layout: TableLayout) -> Result<Self> {
        let existing = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let seen = if existing {
            load_identifiers(path, layout)?
        } else {
            create_table(path, layout)?;
            HashSet::new()
        };
        info!("Opened {} ({} places already recorded)", path.display(), seen.len());

        Ok(Self {
            path: path.to_path_buf(),
            layout,
            seen,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Persist one area's entries, silently skipping identifiers already present.
    pub fn flush(&mut self, area: &str, entries: Vec<AggregationEntry>) -> Result<FlushReport> {
        self.flush_with(area, entries, |path| OpenOptions::new().append(true).open(path))
    }

    fn flush_with<T, O>(&mut self, area: &str, entries: Vec<AggregationEntry>, open: O) -> Result<FlushReport>
    where
        T: AppendTarget,
        O: FnOnce(&Path) -> io::Result<T>,
    {
        let mut report = FlushReport::default();
        let mut fresh = HashSet::new();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        for entry in &entries {
            let id = &entry.record.id;
            if self.seen.contains(id) || !fresh.insert(id.clone()) {
                report.skipped += 1;
                continue;
            }
            writer.write_record(self.layout.row(entry))?;
            report.written += 1;
        }

        if report.written > 0 {
            let bytes = writer.into_inner().map_err(|e| e.into_error())?;
            let mut target = open(&self.path)?;
            append_all_or_nothing(&mut target, &bytes)?;
            self.seen.extend(fresh);
        }

        debug!(area, written = report.written, skipped = report.skipped, "area flushed");
        Ok(report)
    }
}

fn create_table(path: &Path, layout: TableLayout) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(layout.header())?;
    writer.flush()?;
    Ok(())
}

fn load_identifiers(path: &Path, layout: TableLayout) -> Result<HashSet<String>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header = reader.headers()?.clone();
    if !header.iter().eq(layout.header().iter().copied()) {
        return Err(CrawlError::Config(format!(
            "{} has columns [{}], expected the {:?} layout [{}]",
            path.display(),
            header.iter().collect::<Vec<_>>().join(","),
            layout,
            layout.header().join(",")
        )));
    }

    // Every row this sink writes ends in a newline; a tail without one was cut short.
    let file_len = path.metadata()?.len();
    let ends_cleanly = ends_with_newline(path)?;

    let mut seen = HashSet::new();
    let mut record = csv::ByteRecord::new();
    let mut cut_at = None;
    while reader.read_byte_record(&mut record)? {
        let at_tail = reader.position().byte() >= file_len;
        let short = record.len() != layout.header().len();
        if at_tail && (short || !ends_cleanly) {
            cut_at = record.position().map(|p| p.byte());
            break;
        }
        if short {
            return Err(CrawlError::Data {
                source_name: path.display().to_string(),
                line: record.position().map(|p| p.line() as usize).unwrap_or_default(),
                reason: format!("expected {} columns, found {}", layout.header().len(), record.len()),
            });
        }
        if let Some(id) = record
            .get(URL_COLUMN)
            .and_then(|url| std::str::from_utf8(url).ok())
            .and_then(place_id_from_url)
        {
            seen.insert(id.to_string());
        }
    }
    drop(reader);

    if let Some(cut) = cut_at {
        warn!(
            "{} ends with an incomplete row ({} bytes), truncating it",
            path.display(),
            file_len - cut
        );
        OpenOptions::new().write(true).open(path)?.set_len(cut)?;
    }
    Ok(seen)
}

fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Destination of an area append: something that can be written, made
/// durable, and cut back to an earlier length.
trait AppendTarget: Write {
    fn len(&self) -> io::Result<u64>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn append_all_or_nothing<T: AppendTarget>(target: &mut T, bytes: &[u8]) -> Result<()> {
    let before = target.len()?;
    if let Err(err) = write_synced(target, bytes) {
        target.truncate(before)?;
        return Err(err.into());
    }
    Ok(())
}

fn write_synced<T: AppendTarget>(target: &mut T, bytes: &[u8]) -> io::Result<()> {
    target.write_all(bytes)?;
    target.sync()
}

/// Summary of an existing table, for the `stats` command.
#[derive(Debug, Default)]
pub struct TableStats {
    pub rows: usize,
    pub cities: BTreeMap<String, usize>,
}

impl TableStats {
    pub fn top_cities(&self, n: usize) -> Vec<(&str, usize)> {
        let mut cities: Vec<_> = self.cities.iter().map(|(c, count)| (c.as_str(), *count)).collect();
        cities.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        cities.truncate(n);
        cities
    }
}

pub fn table_stats(path: &Path) -> Result<TableStats> {
    let mut reader = csv::Reader::from_path(path)?;
    let city_col = reader
        .headers()?
        .iter()
        .position(|h| h == "city")
        .ok_or_else(|| CrawlError::Config(format!("{} has no city column", path.display())))?;

    let mut stats = TableStats::default();
    for record in reader.records() {
        let record = record?;
        stats.rows += 1;
        let city = record.get(city_col).unwrap_or_default().trim();
        let city = if city.is_empty() { "(unknown)" } else { city };
        *stats.cities.entry(city.to_string()).or_default() += 1;
    }
    Ok(stats)
}

#[cfg(test)]
impl CsvSink {
    pub fn contains(&self, place_id: &str) -> bool {
        self.seen.contains(place_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::places::PlaceRecord;

    fn entry(id: &str, city: &str, keywords: &[&str]) -> AggregationEntry {
        AggregationEntry {
            record: PlaceRecord {
                id: id.into(),
                name: format!("Place {}", id),
                address: format!("1 Rue {}, 5000 {}, Belgium", id, city),
                city: city.into(),
                postal_code: "5000".into(),
                rating: Some(4.5),
                review_count: Some(10),
                types: vec!["store".into(), "food".into()],
            },
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            place_categories: BTreeSet::new(),
            product_categories: BTreeSet::new(),
        }
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn new_table_gets_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/places.csv");

        let mut sink = CsvSink::open(&path, TableLayout::Tagged).unwrap();
        sink.flush("Namur", vec![entry("a", "Namur", &["magasin bio"])]).unwrap();
        drop(sink);
        let mut sink = CsvSink::open(&path, TableLayout::Tagged).unwrap();
        sink.flush("Liège", vec![entry("b", "Liège", &["ferme"])]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("matched_keywords").count(), 1);
        assert!(text.starts_with(&TAGGED_COLUMNS.join(",")));
        assert_eq!(read_rows(&path).len(), 2);
    }

    #[test]
    fn known_ids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        let mut sink = CsvSink::open(&path, TableLayout::Basic).unwrap();

        let first = sink.flush("Namur", vec![entry("a", "Namur", &[]), entry("b", "Namur", &[])]).unwrap();
        assert_eq!(first, FlushReport { written: 2, skipped: 0 });

        let second = sink
            .flush("Jambes", vec![entry("b", "Jambes", &[]), entry("c", "Jambes", &[]), entry("c", "Jambes", &[])])
            .unwrap();
        assert_eq!(second, FlushReport { written: 1, skipped: 2 });
        assert_eq!(read_rows(&path).len(), 3);
    }

    #[test]
    fn reopened_sink_remembers_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        CsvSink::open(&path, TableLayout::Tagged)
            .unwrap()
            .flush("Namur", vec![entry("a", "Namur", &["bio"])])
            .unwrap();

        let mut sink = CsvSink::open(&path, TableLayout::Tagged).unwrap();
        assert!(sink.contains("a"));
        let report = sink.flush("Namur", vec![entry("a", "Namur", &["bio", "ferme"])]).unwrap();
        assert_eq!(report, FlushReport { written: 0, skipped: 1 });
        assert_eq!(read_rows(&path).len(), 1);
    }

    #[test]
    fn crash_after_area_keeps_earlier_areas_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        let areas = [("Namur", "a"), ("Liège", "b"), ("Mons", "c"), ("Arlon", "d")];
        let crash_after = 2;

        {
            let mut sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
            for (area, id) in areas.iter().take(crash_after) {
                sink.flush(area, vec![entry(id, area, &[])]).unwrap();
            }
            // process dies while the next area is still in memory
        }

        let sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
        assert!(sink.contains("a"));
        assert!(sink.contains("b"));
        assert!(!sink.contains("c"));
        assert!(!sink.contains("d"));
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        CsvSink::open(&path, TableLayout::Basic)
            .unwrap()
            .flush("Namur", vec![entry("a", "Namur", &[])])
            .unwrap();
        let intact = std::fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"Place b,\"1 Rue b, 5000 Na").unwrap();
        drop(file);

        let mut sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
        assert!(sink.contains("a"));
        assert!(!sink.contains("b"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        sink.flush("Namur", vec![entry("b", "Namur", &[])]).unwrap();
        let rows = read_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "Place b");
    }

    #[test]
    fn short_row_in_the_middle_is_an_error_not_a_cut() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        CsvSink::open(&path, TableLayout::Basic).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"broken,row\n").unwrap();
        file.write_all(b"Place a,addr,Namur,5000,4.5,10,store,https://www.google.com/maps/place/?q=place_id:a\n")
            .unwrap();
        drop(file);
        let before = std::fs::metadata(&path).unwrap().len();

        let err = CsvSink::open(&path, TableLayout::Basic).err().unwrap();
        assert!(matches!(err, CrawlError::Data { line: 2, .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn row_cut_inside_last_column_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        CsvSink::open(&path, TableLayout::Basic).unwrap();
        let intact = std::fs::metadata(&path).unwrap().len();

        // all eight columns present, but the url is cut and there is no newline
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"Place c,addr,Namur,5000,4.5,10,store,https://www.google.com/maps/place/?q=place_id:c")
            .unwrap();
        drop(file);

        let sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
        assert!(!sink.contains("c"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
    }

    /// Real file that accepts only `budget` bytes before failing.
    struct ShortFile {
        file: File,
        budget: usize,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl AppendTarget for ShortFile {
        fn len(&self) -> io::Result<u64> {
            self.file.len()
        }

        fn sync(&mut self) -> io::Result<()> {
            self.file.sync()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.truncate(len)
        }
    }

    #[test]
    fn failed_append_rolls_back_file_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        let mut sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
        sink.flush("Namur", vec![entry("a", "Namur", &[])]).unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let err = sink
            .flush_with("Liège", vec![entry("b", "Liège", &[]), entry("c", "Liège", &[])], |p| {
                Ok(ShortFile {
                    file: OpenOptions::new().append(true).open(p)?,
                    budget: 40,
                })
            })
            .unwrap_err();
        assert!(matches!(err, CrawlError::Io(_)));

        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
        assert!(!sink.contains("b"));
        assert!(!sink.contains("c"));
        assert_eq!(read_rows(&path).len(), 1);

        let report = sink.flush("Liège", vec![entry("b", "Liège", &[])]).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(read_rows(&path).len(), 2);
    }

    #[test]
    fn tagged_row_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        let mut sink = CsvSink::open(&path, TableLayout::Tagged).unwrap();
        let mut e = entry("abc", "Namur", &["magasin bio", "épicerie"]);
        e.place_categories.insert("Magasin".into());
        sink.flush("Namur", vec![e]).unwrap();

        let rows = read_rows(&path);
        assert_eq!(
            rows[0],
            vec![
                "Place abc",
                "1 Rue abc, 5000 Namur, Belgium",
                "Namur",
                "5000",
                "4.5",
                "10",
                "store|food",
                "https://www.google.com/maps/place/?q=place_id:abc",
                "magasin bio;épicerie",
                "Magasin",
                "",
            ]
        );
    }

    #[test]
    fn mismatched_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        CsvSink::open(&path, TableLayout::Basic).unwrap();
        let err = CsvSink::open(&path, TableLayout::Tagged).err().unwrap();
        assert!(matches!(err, CrawlError::Config(_)));
    }

    #[test]
    fn stats_count_cities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        let mut sink = CsvSink::open(&path, TableLayout::Basic).unwrap();
        sink.flush("Namur", vec![entry("a", "Namur", &[]), entry("b", "Namur", &[]), entry("c", "", &[])])
            .unwrap();
        sink.flush("Liège", vec![entry("d", "Liège", &[])]).unwrap();

        let stats = table_stats(&path).unwrap();
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.top_cities(2), vec![("Namur", 2), ("(unknown)", 1)]);
    }
}
