use std::collections::HashMap;

/// Case-insensitive keyword → category lookup.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    entries: HashMap<String, String>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keyword: &str, category: &str) {
        self.entries.insert(normalize_key(keyword), category.trim().to_string());
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.entries.get(&normalize_key(keyword)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for CategoryTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = CategoryTable::new();
        for (k, v) in iter {
            table.insert(k.as_ref(), v.as_ref());
        }
        table
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Categories {
    pub place: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    place: CategoryTable,
    product: CategoryTable,
}

impl Classifier {
    pub fn new(place: CategoryTable, product: CategoryTable) -> Self {
        Self { place, product }
    }

    pub fn classify(&self, keyword: &str) -> Categories {
        Categories {
            place: self.place.get(keyword).map(str::to_string),
            product: self.product.get(keyword).map(str::to_string),
        }
    }
}

/// Lowercase, trimmed, inner whitespace collapsed.
pub fn normalize_key(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
