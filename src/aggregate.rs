use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::classify::{normalize_key, Categories};
use crate::places::PlaceRecord;

const DEFAULT_EXCLUDED_TYPES: &[&str] = &["courthouse", "local_government_office"];
const DEFAULT_EXCLUDED_NAME_TERMS: &[&str] = &["tribunal", "palais"];

const PRODUCER_TYPES: &[&str] = &["farm", "farmers_market"];
const PRODUCER_NAME_TERMS: &[&str] = &[
    "maraicher",
    "maraîcher",
    "miellerie",
    "apiculteur",
    "élevage",
    "fermier",
    "volaille",
    "marché fermier",
    "producteur",
    "ferme",
];

/// Admission policy applied once, when a record is first observed.
#[derive(Debug, Clone, Default)]
pub struct PlaceFilter {
    excluded_types: HashSet<String>,
    excluded_name_terms: Vec<String>,
    /// When set, a place must match one of these types or name terms.
    required: Option<(HashSet<String>, Vec<String>)>,
}

impl PlaceFilter {
    /// Admits everything.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Drops courthouses and government offices that keyword searches pick up.
    pub fn standard() -> Self {
        Self::permissive()
            .exclude_types(DEFAULT_EXCLUDED_TYPES.iter().copied())
            .exclude_name_terms(DEFAULT_EXCLUDED_NAME_TERMS.iter().copied())
    }

    pub fn exclude_types<'a>(mut self, types: impl IntoIterator<Item = &'a str>) -> Self {
        self.excluded_types
            .extend(types.into_iter().map(|t| t.trim().to_lowercase()));
        self
    }

    pub fn exclude_name_terms<'a>(mut self, terms: impl IntoIterator<Item = &'a str>) -> Self {
        self.excluded_name_terms
            .extend(terms.into_iter().map(|t| t.trim().to_lowercase()));
        self
    }

    /// Keep only farms and producers.
    pub fn producers_only(mut self) -> Self {
        self.required = Some((
            PRODUCER_TYPES.iter().map(|t| t.to_string()).collect(),
            PRODUCER_NAME_TERMS.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    pub fn admits(&self, record: &PlaceRecord) -> bool {
        let name = record.name.to_lowercase();
        if record.types.iter().any(|t| self.excluded_types.contains(t)) {
            return false;
        }
        if self.excluded_name_terms.iter().any(|term| name.contains(term)) {
            return false;
        }
        match &self.required {
            Some((types, terms)) => {
                record.types.iter().any(|t| types.contains(t))
                    || terms.iter().any(|term| name.contains(term))
            }
            None => true,
        }
    }
}

/// One place and everything that matched it during an area's crawl.
#[derive(Debug, Clone)]
pub struct AggregationEntry {
    pub record: PlaceRecord,
    pub keywords: BTreeSet<String>,
    pub place_categories: BTreeSet<String>,
    pub product_categories: BTreeSet<String>,
}

impl AggregationEntry {
    fn new(record: PlaceRecord) -> Self {
        Self {
            record,
            keywords: BTreeSet::new(),
            place_categories: BTreeSet::new(),
            product_categories: BTreeSet::new(),
        }
    }

    fn tag(&mut self, keyword: &str, categories: &Categories) {
        self.keywords.insert(normalize_key(keyword));
        if let Some(place) = &categories.place {
            self.place_categories.insert(place.clone());
        }
        if let Some(product) = &categories.product {
            self.product_categories.insert(product.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Merged,
    Filtered,
}

/// Accumulator for a single area. Created at area start, drained at area end.
pub struct AreaAggregator<'f> {
    area: String,
    filter: &'f PlaceFilter,
    index: HashMap<String, usize>,
    entries: Vec<AggregationEntry>,
    rejected: HashSet<String>,
}

impl<'f> AreaAggregator<'f> {
    pub fn new(area: &str, filter: &'f PlaceFilter) -> Self {
        Self {
            area: area.to_string(),
            filter,
            index: HashMap::new(),
            entries: Vec::new(),
            rejected: HashSet::new(),
        }
    }

    /// Record one hit. The first observation of an id keeps its record; every
    /// observation unions in the keyword and categories.
    pub fn observe(&mut self, record: PlaceRecord, keyword: &str, categories: &Categories) -> Observation {
        if let Some(&pos) = self.index.get(&record.id) {
            self.entries[pos].tag(keyword, categories);
            return Observation::Merged;
        }
        if self.rejected.contains(&record.id) {
            return Observation::Filtered;
        }
        if !self.filter.admits(&record) {
            self.rejected.insert(record.id);
            return Observation::Filtered;
        }

        let mut entry = AggregationEntry::new(record);
        entry.tag(keyword, categories);
        self.index.insert(entry.record.id.clone(), self.entries.len());
        self.entries.push(entry);
        Observation::New
    }

    /// Hand over the finalized entries, leaving the accumulator empty.
    pub fn drain(&mut self) -> Vec<AggregationEntry> {
        debug!(area = %self.area, entries = self.entries.len(), filtered = self.rejected.len(), "area drained");
        self.index.clear();
        self.rejected.clear();
        std::mem::take(&mut self.entries)
    }
}
