//! Index mapping: the per-index field descriptor and its tantivy schema.

use crate::error::{GriddleError, Result};
use crate::types::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tantivy::schema::{
    DateOptions, DateTimePrecision, Field, NumericOptions, Schema as TantivySchema,
    TextFieldIndexing, TextOptions, FAST, INDEXED, STORED, STRING, TEXT,
};
use tantivy::TantivyDocument;

pub const ID_FIELD: &str = "_id";
pub const TIMESTAMP_FIELD: &str = "_timestamp";
pub const SOURCE_FIELD: &str = "_source";
pub const ALL_FIELD: &str = "_all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Tokenized full text.
    Text,
    /// Untokenized string; usable for exact match and `terms` aggregations.
    Keyword,
    /// 64-bit float; usable for sorting, `range` and metric aggregations.
    Numeric,
    /// RFC 3339 string or epoch milliseconds; sortable.
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Field name → field mapping. Fields absent from the mapping are still kept
/// in `_source` and searchable through `_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMapping>,
}

impl IndexMapping {
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), FieldMapping { field_type });
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        match name {
            TIMESTAMP_FIELD => Some(FieldType::Numeric),
            _ => self.fields.get(name).map(|m| m.field_type),
        }
    }

    /// # Errors
    ///
    /// Returns [`GriddleError::InvalidMapping`] for empty names, names with a
    /// leading underscore (reserved for system fields) or names containing `:`
    /// which the query syntax treats as a field separator.
    pub fn validate(&self) -> Result<()> {
        for name in self.fields.keys() {
            if name.is_empty() {
                return Err(GriddleError::InvalidMapping(
                    "field names must not be empty".to_string(),
                ));
            }
            if name.starts_with('_') {
                return Err(GriddleError::InvalidMapping(format!(
                    "field name '{}' is reserved: names starting with '_' are system fields",
                    name
                )));
            }
            if name.contains(':') || name.contains(char::is_whitespace) {
                return Err(GriddleError::InvalidMapping(format!(
                    "field name '{}' contains an invalid character",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check that `field` can serve as the default search field.
    pub fn validate_search_field(&self, field: &str) -> Result<()> {
        if field == ALL_FIELD {
            return Ok(());
        }
        match self.fields.get(field).map(|m| m.field_type) {
            Some(FieldType::Text) | Some(FieldType::Keyword) => Ok(()),
            Some(other) => Err(GriddleError::InvalidMapping(format!(
                "default search field '{}' has type {:?}; expected text or keyword",
                field, other
            ))),
            None => Err(GriddleError::InvalidMapping(format!(
                "default search field '{}' is not mapped",
                field
            ))),
        }
    }

    pub fn to_tantivy(&self) -> TantivySchema {
        let mut builder = TantivySchema::builder();

        builder.add_text_field(ID_FIELD, STRING | STORED | FAST);
        builder.add_i64_field(TIMESTAMP_FIELD, INDEXED | STORED | FAST);
        builder.add_text_field(SOURCE_FIELD, TextOptions::default().set_stored());

        let all_indexing = TextFieldIndexing::default()
            .set_tokenizer("default")
            .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions);
        builder.add_text_field(
            ALL_FIELD,
            TextOptions::default().set_indexing_options(all_indexing),
        );

        for (name, mapping) in &self.fields {
            match mapping.field_type {
                FieldType::Text => {
                    builder.add_text_field(name, TEXT);
                }
                FieldType::Keyword => {
                    builder.add_text_field(name, STRING | FAST);
                }
                FieldType::Numeric => {
                    builder.add_f64_field(
                        name,
                        NumericOptions::default().set_indexed().set_fast(),
                    );
                }
                FieldType::Datetime => {
                    builder.add_date_field(
                        name,
                        DateOptions::default()
                            .set_indexed()
                            .set_fast()
                            .set_precision(DateTimePrecision::Milliseconds),
                    );
                }
            }
        }

        builder.build()
    }
}

/// Resolved tantivy field handles for one shard's schema.
#[derive(Debug, Clone)]
pub struct DocumentConverter {
    mapping: IndexMapping,
    id_field: Field,
    timestamp_field: Field,
    source_field: Field,
    all_field: Field,
    mapped: Vec<(String, FieldType, Field)>,
}

impl DocumentConverter {
    pub fn new(mapping: &IndexMapping, schema: &TantivySchema) -> Result<Self> {
        let field = |name: &str| {
            schema.get_field(name).map_err(|_| {
                GriddleError::InvalidMapping(format!("schema is missing field '{}'", name))
            })
        };
        let mut mapped = Vec::with_capacity(mapping.fields.len());
        for (name, m) in &mapping.fields {
            mapped.push((name.clone(), m.field_type, field(name)?));
        }
        Ok(DocumentConverter {
            mapping: mapping.clone(),
            id_field: field(ID_FIELD)?,
            timestamp_field: field(TIMESTAMP_FIELD)?,
            source_field: field(SOURCE_FIELD)?,
            all_field: field(ALL_FIELD)?,
            mapped,
        })
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    pub fn id_field(&self) -> Field {
        self.id_field
    }

    pub fn timestamp_field(&self) -> Field {
        self.timestamp_field
    }

    pub fn source_field(&self) -> Field {
        self.source_field
    }

    pub fn to_tantivy(&self, doc: &Document, timestamp: i64) -> Result<TantivyDocument> {
        let mut tantivy_doc = TantivyDocument::new();

        tantivy_doc.add_text(self.id_field, &doc.id);
        tantivy_doc.add_i64(self.timestamp_field, timestamp);
        tantivy_doc.add_text(
            self.source_field,
            serde_json::to_string(&doc.fields)?,
        );

        for value in doc.fields.values() {
            collect_strings(value, &mut |s| tantivy_doc.add_text(self.all_field, s));
        }

        for (name, field_type, field) in &self.mapped {
            let Some(value) = doc.fields.get(name) else {
                continue;
            };
            for item in scalar_values(value) {
                match field_type {
                    FieldType::Text | FieldType::Keyword => match item {
                        Value::String(s) => tantivy_doc.add_text(*field, s),
                        Value::Number(n) => tantivy_doc.add_text(*field, n.to_string()),
                        Value::Bool(b) => tantivy_doc.add_text(*field, b.to_string()),
                        _ => {}
                    },
                    FieldType::Numeric => {
                        let n = item.as_f64().ok_or_else(|| {
                            type_mismatch(&doc.id, name, "numeric", item)
                        })?;
                        tantivy_doc.add_f64(*field, n);
                    }
                    FieldType::Datetime => {
                        let dt = parse_datetime(item)
                            .ok_or_else(|| type_mismatch(&doc.id, name, "datetime", item))?;
                        tantivy_doc.add_date(*field, dt);
                    }
                }
            }
        }

        Ok(tantivy_doc)
    }
}

fn type_mismatch(id: &str, field: &str, expected: &str, got: &Value) -> GriddleError {
    GriddleError::InvalidDocument(format!(
        "document '{}': field '{}' expects a {} value, got {}",
        id, field, expected, got
    ))
}

/// Top-level scalars, or the elements of a top-level array. Nulls are skipped.
fn scalar_values(value: &Value) -> Vec<&Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
        other => vec![other],
    }
}

fn collect_strings(value: &Value, sink: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => sink(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, sink)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, sink)),
        _ => {}
    }
}

fn parse_datetime(value: &Value) -> Option<tantivy::DateTime> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| tantivy::DateTime::from_timestamp_millis(dt.timestamp_millis())),
        Value::Number(n) => n.as_i64().map(tantivy::DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tantivy::schema::OwnedValue;

    fn owned<V: Into<OwnedValue>>(v: Option<V>) -> Option<OwnedValue> {
        v.map(Into::into)
    }

    fn mapping() -> IndexMapping {
        IndexMapping::default()
            .with_field("title", FieldType::Text)
            .with_field("brand", FieldType::Keyword)
            .with_field("price", FieldType::Numeric)
            .with_field("released", FieldType::Datetime)
    }

    #[test]
    fn mapping_wire_form() {
        let m: IndexMapping = serde_json::from_value(json!({
            "fields": {"title": {"type": "text"}, "price": {"type": "numeric"}}
        }))
        .unwrap();
        assert_eq!(m.field_type("title"), Some(FieldType::Text));
        assert_eq!(m.field_type("price"), Some(FieldType::Numeric));
        assert_eq!(m.field_type(TIMESTAMP_FIELD), Some(FieldType::Numeric));
        assert_eq!(m.field_type("missing"), None);
    }

    #[test]
    fn unknown_field_type_is_rejected() {
        let r: std::result::Result<IndexMapping, _> =
            serde_json::from_value(json!({"fields": {"x": {"type": "vector"}}}));
        assert!(r.is_err());
    }

    #[test]
    fn reserved_names_are_rejected() {
        let m = IndexMapping::default().with_field("_secret", FieldType::Text);
        assert!(matches!(m.validate(), Err(GriddleError::InvalidMapping(_))));
        let m = IndexMapping::default().with_field("a:b", FieldType::Text);
        assert!(m.validate().is_err());
        assert!(mapping().validate().is_ok());
    }

    #[test]
    fn search_field_must_be_textual() {
        let m = mapping();
        assert!(m.validate_search_field(ALL_FIELD).is_ok());
        assert!(m.validate_search_field("title").is_ok());
        assert!(m.validate_search_field("brand").is_ok());
        assert!(m.validate_search_field("price").is_err());
        assert!(m.validate_search_field("nope").is_err());
    }

    #[test]
    fn schema_has_system_and_mapped_fields() {
        let schema = mapping().to_tantivy();
        for name in [ID_FIELD, TIMESTAMP_FIELD, SOURCE_FIELD, ALL_FIELD, "title", "brand", "price", "released"] {
            assert!(schema.get_field(name).is_ok(), "missing {}", name);
        }
    }

    #[test]
    fn converter_builds_document() {
        let m = mapping();
        let schema = m.to_tantivy();
        let conv = DocumentConverter::new(&m, &schema).unwrap();
        let doc = Document::new(
            "p1",
            json!({"title": "Red Laptop", "brand": "acme", "price": 999.5,
                   "released": "2024-01-02T03:04:05Z", "extra": {"note": "hidden gem"}}),
        );
        let td = conv.to_tantivy(&doc, 42).unwrap();

        assert_eq!(
            owned(td.get_first(conv.id_field())),
            Some(OwnedValue::Str("p1".to_string()))
        );
        assert_eq!(
            owned(td.get_first(conv.timestamp_field())),
            Some(OwnedValue::I64(42))
        );
        let Some(OwnedValue::Str(source)) = owned(td.get_first(conv.source_field())) else {
            panic!("missing _source");
        };
        let back: serde_json::Value = serde_json::from_str(&source).unwrap();
        assert_eq!(back["price"], json!(999.5));

        let all = schema.get_field(ALL_FIELD).unwrap();
        let all_values: Vec<String> = td
            .get_all(all)
            .filter_map(|v| {
                let owned: OwnedValue = v.into();
                match owned {
                    OwnedValue::Str(s) => Some(s),
                    _ => None,
                }
            })
            .collect();
        assert!(all_values.iter().any(|s| s == "Red Laptop"));
        assert!(all_values.iter().any(|s| s == "hidden gem"));
    }

    #[test]
    fn converter_rejects_type_mismatch() {
        let m = mapping();
        let conv = DocumentConverter::new(&m, &m.to_tantivy()).unwrap();
        let bad = Document::new("p2", json!({"price": "cheap"}));
        assert!(matches!(
            conv.to_tantivy(&bad, 0),
            Err(GriddleError::InvalidDocument(_))
        ));
        let bad_date = Document::new("p3", json!({"released": "yesterday"}));
        assert!(conv.to_tantivy(&bad_date, 0).is_err());
    }

    #[test]
    fn arrays_and_nulls() {
        let m = mapping();
        let conv = DocumentConverter::new(&m, &m.to_tantivy()).unwrap();
        let doc = Document::new("p4", json!({"brand": ["a", "b"], "price": null}));
        let td = conv.to_tantivy(&doc, 0).unwrap();
        let brand = m.to_tantivy().get_field("brand").unwrap();
        assert_eq!(td.get_all(brand).count(), 2);
    }
}
