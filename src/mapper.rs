//! Dublin Core → item schema mapping.
//!
//! [`DcMapper`] takes one harvested record and the schema registry, picks a
//! resource category from the record's `dc:type` elements, and maps every
//! supported Dublin Core element into the newest schema for that category.
//!
//! # Classification
//!
//! `dc:type` values are matched case-insensitively against a fixed keyword
//! table ([`ResourceCategory::from_keyword`]). The first element with a
//! known keyword decides the category; a record with none is `Multiple`.
//!
//! # Field mapping
//!
//! Each supported element has a concept: the schema title of its field
//! and the shape of one entry. Every occurrence of the element produces one
//! entry appended to the field's list, in document order. Sub-attributes the
//! Dublin Core source cannot supply are filled with empty strings.
//!
//! ```text
//! <dc:creator xml:lang="en">Doe, Jane</dc:creator>
//!      │
//!      ▼
//! "item_10": [{ "aff": "", ..., "names": { "name": "Doe, Jane", "lang": "en" } }]
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{HarvestError, MappingError};
use crate::models::OaiRecord;
use crate::schema::{ItemTypeSchema, SchemaRegistry};

/// Target category of a harvested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Article,
    Book,
    CartographicMaterial,
    ConferenceObject,
    Dataset,
    Image,
    Lecture,
    Patent,
    Report,
    Sound,
    Thesis,
    Multiple,
}

impl ResourceCategory {
    /// Category name as stored on item type schemas.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Article => "Article",
            ResourceCategory::Book => "Book",
            ResourceCategory::CartographicMaterial => "Cartographic Material",
            ResourceCategory::ConferenceObject => "Conference object",
            ResourceCategory::Dataset => "Dataset",
            ResourceCategory::Image => "Image",
            ResourceCategory::Lecture => "Lecture",
            ResourceCategory::Patent => "Patent",
            ResourceCategory::Report => "Report",
            ResourceCategory::Sound => "Sound",
            ResourceCategory::Thesis => "Thesis",
            ResourceCategory::Multiple => "Multiple",
        }
    }

    /// Look up a `dc:type` value in the keyword table.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        use ResourceCategory::*;
        let category = match keyword.trim().to_lowercase().as_str() {
            "conference paper" | "data paper" | "departmental bulletin paper" | "editorial"
            | "journal article" | "periodical" | "review article" | "article" => Article,
            "book" | "book part" => Book,
            "cartographic material" | "map" => CartographicMaterial,
            "conference object" | "conference proceedings" | "conference poster"
            | "presentation" => ConferenceObject,
            "dataset" => Dataset,
            "image" | "still image" | "moving image" | "video" => Image,
            "lecture" => Lecture,
            "patent" => Patent,
            "internal report" | "report" | "research report" | "technical report"
            | "policy report" | "report part" | "working paper" | "research paper" => Report,
            "sound" => Sound,
            "thesis" | "bachelor thesis" | "master thesis" | "doctoral thesis"
            | "thesis or dissertation" => Thesis,
            "interactive resource" | "learning material" | "musical notation"
            | "research proposal" | "software" | "technical documentation" | "workflow"
            | "other" => Multiple,
            _ => return None,
        };
        Some(category)
    }

    /// First known keyword wins; no match means `Multiple`.
    pub fn classify<'a>(types: impl IntoIterator<Item = &'a str>) -> Self {
        types
            .into_iter()
            .find_map(Self::from_keyword)
            .unwrap_or(ResourceCategory::Multiple)
    }
}

/// Where a value in a mapped entry comes from.
#[derive(Debug)]
enum Slot {
    /// The element's text.
    Value,
    /// The element's `xml:lang`, or empty.
    Lang,
    /// Always the empty string.
    Empty,
    /// A nested object with its own slots.
    Nested(&'static [(&'static str, Slot)]),
}

/// A mappable Dublin Core element.
#[derive(Debug)]
struct Concept {
    element: &'static str,
    title: &'static str,
    entry: &'static [(&'static str, Slot)],
}

/// Mapped elements, in output field order. `type`, `format`, `source` and
/// `coverage` are recognized Dublin Core but carry no field.
const CONCEPTS: &[Concept] = &[
    Concept {
        element: "title",
        title: "Title",
        entry: &[("Title", Slot::Value), ("Language", Slot::Lang)],
    },
    Concept {
        element: "creator",
        title: "Creator",
        entry: &[
            ("Affiliation", Slot::Empty),
            ("Creator Alternative", Slot::Empty),
            ("Creator Name Identifier", Slot::Empty),
            ("Family Name", Slot::Empty),
            ("Given Name", Slot::Empty),
            (
                "Creator Name",
                Slot::Nested(&[("Creator Name", Slot::Value), ("Language", Slot::Lang)]),
            ),
        ],
    },
    Concept {
        element: "contributor",
        title: "Contributor",
        entry: &[
            ("Affiliation", Slot::Empty),
            ("Contributor Alternative", Slot::Empty),
            ("Contributor Name Identifier", Slot::Empty),
            ("Family Name", Slot::Empty),
            ("Given Name", Slot::Empty),
            (
                "Contributor Name",
                Slot::Nested(&[("Contributor Name", Slot::Value), ("Language", Slot::Lang)]),
            ),
        ],
    },
    Concept {
        element: "rights",
        title: "Rights",
        entry: &[
            ("Rights Resource", Slot::Empty),
            (
                "Rights",
                Slot::Nested(&[("Rights", Slot::Value), ("Language", Slot::Lang)]),
            ),
        ],
    },
    Concept {
        element: "subject",
        title: "Subject",
        entry: &[
            ("Subject", Slot::Value),
            ("Subject URI", Slot::Empty),
            ("Subject Scheme", Slot::Empty),
            ("Language", Slot::Lang),
        ],
    },
    Concept {
        element: "description",
        title: "Description",
        entry: &[
            ("Description", Slot::Value),
            ("Description Type", Slot::Empty),
            ("Language", Slot::Lang),
        ],
    },
    Concept {
        element: "publisher",
        title: "Publisher",
        entry: &[("Publisher", Slot::Value), ("Language", Slot::Lang)],
    },
    Concept {
        element: "date",
        title: "Date",
        entry: &[("Date", Slot::Value), ("Date Type", Slot::Empty)],
    },
    Concept {
        element: "identifier",
        title: "Identifier",
        entry: &[("Identifier", Slot::Value), ("Identifier Type", Slot::Empty)],
    },
    Concept {
        element: "language",
        title: "Language",
        entry: &[("Language", Slot::Value)],
    },
    Concept {
        element: "relation",
        title: "Relation",
        entry: &[
            ("Relation", Slot::Value),
            ("Relation Type", Slot::Empty),
            (
                "Related Identifier",
                Slot::Nested(&[
                    ("Related Identifier", Slot::Empty),
                    ("Related Identifier Type", Slot::Empty),
                ]),
            ),
            (
                "Related Title",
                Slot::Nested(&[("Related Title", Slot::Empty), ("Language", Slot::Empty)]),
            ),
        ],
    },
];

/// One occurrence of a Dublin Core element.
#[derive(Debug, Clone, PartialEq)]
pub struct DcElement {
    pub text: String,
    pub lang: Option<String>,
}

/// A record mapped into its item schema.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedItem {
    pub schema_id: i64,
    pub category: ResourceCategory,
    /// Field key → list of entries, in first-seen order.
    pub fields: Map<String, Value>,
}

impl MappedItem {
    /// The catalog document: `$schema` followed by the mapped fields.
    pub fn document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("$schema".to_string(), Value::from(self.schema_id));
        for (key, value) in &self.fields {
            doc.insert(key.clone(), value.clone());
        }
        Value::Object(doc)
    }

    /// SHA-256 of the serialized document.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Maps one harvested record.
pub struct DcMapper<'a> {
    record: &'a OaiRecord,
    category: ResourceCategory,
    schema: Option<&'a ItemTypeSchema>,
}

impl<'a> DcMapper<'a> {
    /// Classify the record and select the newest schema for its category.
    pub fn new(record: &'a OaiRecord, registry: &'a SchemaRegistry) -> Result<Self, MappingError> {
        let types = extract_elements(&record.metadata, "dc:type")?;
        let category = ResourceCategory::classify(types.iter().map(|t| t.text.as_str()));
        Ok(Self {
            record,
            category,
            schema: registry.newest_for(category.as_str()),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.record.identifier
    }

    pub fn datestamp(&self) -> DateTime<Utc> {
        self.record.datestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.record.deleted
    }

    pub fn set_specs(&self) -> &[String] {
        &self.record.set_specs
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    pub fn map(&self) -> Result<MappedItem, HarvestError> {
        let schema = self
            .schema
            .ok_or_else(|| HarvestError::SchemaUnavailable(self.category.as_str().to_string()))?;

        let mut fields = Map::new();
        for concept in CONCEPTS {
            let tag = format!("dc:{}", concept.element);
            let occurrences = extract_elements(&self.record.metadata, &tag)?;
            if occurrences.is_empty() {
                continue;
            }

            let field = lookup(schema, &[concept.title])?;
            for element in &occurrences {
                let entry = build_entry(schema, &[concept.title], concept.entry, element)?;
                let list = fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = list {
                    items.push(entry);
                }
            }
        }

        Ok(MappedItem {
            schema_id: schema.id,
            category: self.category,
            fields,
        })
    }
}

fn lookup(schema: &ItemTypeSchema, path: &[&str]) -> Result<String, MappingError> {
    schema
        .field_key(path)
        .map(str::to_string)
        .ok_or_else(|| MappingError::MissingField {
            schema_id: schema.id,
            path: path.join("/"),
        })
}

fn build_entry(
    schema: &ItemTypeSchema,
    parent: &[&str],
    slots: &[(&'static str, Slot)],
    element: &DcElement,
) -> Result<Value, MappingError> {
    let mut entry = Map::new();
    for (title, slot) in slots {
        let mut path = parent.to_vec();
        path.push(title);
        let key = lookup(schema, &path)?;
        let value = match slot {
            Slot::Value => Value::String(element.text.clone()),
            Slot::Lang => Value::String(element.lang.clone().unwrap_or_default()),
            Slot::Empty => Value::String(String::new()),
            Slot::Nested(inner) => build_entry(schema, &path, inner, element)?,
        };
        entry.insert(key, value);
    }
    Ok(Value::Object(entry))
}

/// Every non-empty `<tag ...>text</tag>` in `xml`, in document order.
///
/// Opening tags may carry attributes. Self-closing and empty elements are
/// skipped. Text is XML-unescaped; CDATA sections are taken literally.
pub fn extract_elements(xml: &str, tag: &str) -> Result<Vec<DcElement>, MappingError> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let at_boundary = matches!(
            after.chars().next(),
            Some(c) if c == '>' || c == '/' || c.is_whitespace()
        );
        if !at_boundary {
            rest = after;
            continue;
        }

        let Some(gt) = after.find('>') else {
            break;
        };
        let attrs = &after[..gt];
        let body = &after[gt + 1..];
        if attrs.trim_end().ends_with('/') {
            rest = body;
            continue;
        }

        let Some(end) = body.find(&close) else {
            break;
        };
        let raw = body[..end].trim();
        rest = &body[end + close.len()..];
        if raw.is_empty() {
            continue;
        }

        let text = decode_text(raw).map_err(|e| MappingError::Malformed {
            element: tag.to_string(),
            reason: e.to_string(),
        })?;
        out.push(DcElement {
            text,
            lang: attribute_value(attrs, "xml:lang").filter(|l| !l.is_empty()),
        });
    }

    Ok(out)
}

fn decode_text(raw: &str) -> Result<String, quick_xml::escape::EscapeError> {
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find(CDATA_OPEN) {
        text.push_str(&quick_xml::escape::unescape(&rest[..start])?);
        let section = &rest[start + CDATA_OPEN.len()..];
        match section.find(CDATA_CLOSE) {
            Some(end) => {
                text.push_str(&section[..end]);
                rest = &section[end + CDATA_CLOSE.len()..];
            }
            None => {
                text.push_str(section);
                rest = "";
            }
        }
    }
    text.push_str(&quick_xml::escape::unescape(rest)?);
    Ok(text)
}

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Value of `name="..."` (or single-quoted) within an opening tag's attributes.
fn attribute_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{}=", name);
    let mut search = attrs;
    while let Some(pos) = search.find(&needle) {
        let preceded_ok = search[..pos]
            .chars()
            .last()
            .map(|c| c.is_whitespace())
            .unwrap_or(true);
        let value = &search[pos + needle.len()..];
        if preceded_ok {
            let quote = value.chars().next()?;
            if quote != '"' && quote != '\'' {
                return None;
            }
            let inner = &value[1..];
            let close = inner.find(quote)?;
            return Some(inner[..close].to_string());
        }
        search = value;
    }
    None
}
