//! Policy catalog: the ordered item set every subject is measured on.
//!
//! Items are loaded once per run and never mutated. The catalog's fingerprint
//! is a blake3 digest over the exact ordered `(id, text)` sequence and is half
//! of every utility cache key.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A single policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Content-derived identifier, stable across runs.
    pub id: String,
    /// Informational grouping; not used by the fitter.
    pub category: String,
    pub text: String,
}

impl Item {
    pub fn new(category: impl Into<String>, text: impl Into<String>) -> Self {
        let category = category.into();
        let text = text.into();
        let id = item_id(&category, &text);
        Self { id, category, text }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("catalog must contain at least two items, found {0}")]
    TooSmall(usize),
    #[error("duplicate item id {id} ({text})")]
    Duplicate { id: String, text: String },
}

/// Ordered, validated item set with a precomputed fingerprint.
#[derive(Debug, Clone)]
pub struct ItemCatalog {
    items: Vec<Item>,
    fingerprint: String,
}

impl ItemCatalog {
    pub fn new(items: Vec<Item>) -> Result<Self, CatalogError> {
        if items.len() < 2 {
            return Err(CatalogError::TooSmall(items.len()));
        }
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(item.id.as_str()) {
                return Err(CatalogError::Duplicate {
                    id: item.id.clone(),
                    text: item.text.clone(),
                });
            }
        }
        let fingerprint = fingerprint(&items);
        Ok(Self { items, fingerprint })
    }

    /// Flatten `{category: [statement, ...]}` with categories in sorted order
    /// and statements in their listed order.
    pub fn from_categories(categories: &BTreeMap<String, Vec<String>>) -> Result<Self, CatalogError> {
        let items = categories
            .iter()
            .flat_map(|(category, statements)| {
                statements.iter().map(move |text| Item::new(category, text))
            })
            .collect();
        Self::new(items)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let categories: BTreeMap<String, Vec<String>> = serde_json::from_str(raw)?;
        Self::from_categories(&categories)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Stable identifier of the exact ordered item set.
pub fn fingerprint(items: &[Item]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("items:{}", items.len()).as_bytes());
    for item in items {
        hasher.update(b"\x1e");
        hasher.update(item.id.as_bytes());
        hasher.update(b"|");
        hasher.update(item.text.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn item_id(category: &str, text: &str) -> String {
    let digest = hash_fields(&[category, text]);
    digest[..16].to_string()
}

pub(crate) fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub(crate) fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
