//! Item type schemas and their title→key lookup.
//!
//! An item type schema is an externally maintained JSON Schema document whose
//! `properties` carry machine keys (`item_1617186331708`) and human titles
//! (`"Creator"`). The mapper addresses fields by title path, e.g.
//! `["Creator", "Creator Name", "Language"]`, so every schema builds a
//! title tree once, at load time, and answers [`ItemTypeSchema::field_key`]
//! lookups from it.
//!
//! Several versions of a schema may exist per resource category; the one
//! with the newest `updated_at` is authoritative (see
//! [`SchemaRegistry::newest_for`]).

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Top-level properties that are never addressed by title.
pub const DEFAULT_FIELDS: [&str; 6] = [
    "title_en",
    "title_ja",
    "keywords",
    "keywords_en",
    "pubdate",
    "lang",
];

/// One titled property and its titled sub-properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldNode {
    pub key: String,
    pub children: HashMap<String, FieldNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemTypeSchema {
    pub id: i64,
    /// Resource category this schema serves, e.g. `"Dataset"`.
    pub category: String,
    pub updated_at: DateTime<Utc>,
    pub schema: Value,
    fields: HashMap<String, FieldNode>,
}

impl ItemTypeSchema {
    pub fn new(id: i64, category: impl Into<String>, updated_at: DateTime<Utc>, schema: Value) -> Self {
        let fields = title_tree(&schema, true);
        Self {
            id,
            category: category.into(),
            updated_at,
            schema,
            fields,
        }
    }

    /// Machine key of the field reached by following `titles` from the root.
    ///
    /// Returns `None` when any step of the path is not defined.
    pub fn field_key(&self, titles: &[&str]) -> Option<&str> {
        let (first, rest) = titles.split_first()?;
        let mut node = self.fields.get(*first)?;
        for title in rest {
            node = node.children.get(*title)?;
        }
        Some(node.key.as_str())
    }

    /// Number of top-level titled fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// Build the title tree for a schema object.
///
/// Sub-properties are found under `items.properties` (arrays of objects) or
/// `properties` (plain objects). Properties without a string `title` are
/// not addressable and are left out.
fn title_tree(node: &Value, top_level: bool) -> HashMap<String, FieldNode> {
    let mut out = HashMap::new();
    let Some(properties) = node.get("properties").and_then(Value::as_object) else {
        return out;
    };

    for (key, prop) in properties {
        if top_level && DEFAULT_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let Some(title) = prop.get("title").and_then(Value::as_str) else {
            continue;
        };
        let children = match prop.get("items") {
            Some(items) => title_tree(items, false),
            None => title_tree(prop, false),
        };
        out.insert(
            title.to_string(),
            FieldNode {
                key: key.clone(),
                children,
            },
        );
    }
    out
}

/// All known schema versions, queried by category.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<ItemTypeSchema>,
}

impl SchemaRegistry {
    pub fn new(schemas: Vec<ItemTypeSchema>) -> Self {
        Self { schemas }
    }

    /// Newest schema for `category`; ties go to the higher id.
    pub fn newest_for(&self, category: &str) -> Option<&ItemTypeSchema> {
        self.schemas
            .iter()
            .filter(|s| s.category == category)
            .max_by_key(|s| (s.updated_at, s.id))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
