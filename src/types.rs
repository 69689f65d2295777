use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Index identifier, e.g. `"products"`.
pub type IndexName = String;
/// Shard identifier, e.g. `"shard-x7k2m9qa"`.
pub type ShardName = String;
/// Document identifier.
pub type DocumentId = String;

pub const SCORE_FIELD: &str = "_score";
pub const DEFAULT_SORT_BY: &str = "-_score";
pub const DEFAULT_NUM: usize = 10;

/// A document with an ID and a set of named fields.
///
/// Use [`Document::from_json`] to parse from a flat JSON object. Between
/// nodes documents travel in their derived serde form (`{"id", "fields"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: serde_json::Value) -> Self {
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Document {
            id: id.into(),
            fields,
        }
    }

    /// Parse a [`Document`] from a flat JSON object.
    ///
    /// Accepts either `"id"` or `"_id"` as the identifier; string and
    /// integer ids are both accepted. All other keys become fields.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GriddleError::InvalidDocument`] if the value is not a
    /// JSON object or carries no usable id.
    pub fn from_json(json: &serde_json::Value) -> crate::error::Result<Self> {
        use crate::error::GriddleError;

        let obj = json
            .as_object()
            .ok_or_else(|| GriddleError::InvalidDocument("Expected JSON object".to_string()))?;

        let id = match obj.get("id").or_else(|| obj.get("_id")) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(GriddleError::InvalidDocument(
                    "document is missing a non-empty \"id\"".to_string(),
                ))
            }
        };

        let fields = obj
            .iter()
            .filter(|(key, _)| key.as_str() != "id" && key.as_str() != "_id")
            .map(|(key, val)| (key.clone(), val.clone()))
            .collect();

        Ok(Document { id, fields })
    }

    /// Convert back to the flat JSON form accepted by [`Document::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Parsed `sort_by` value. A leading `-` means descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortBy {
    pub field: String,
    pub order: SortOrder,
}

impl SortBy {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return SortBy::default();
        }
        match value.strip_prefix('-') {
            Some(field) => SortBy {
                field: field.to_string(),
                order: SortOrder::Desc,
            },
            None => SortBy {
                field: value.to_string(),
                order: SortOrder::Asc,
            },
        }
    }

    pub fn is_score(&self) -> bool {
        self.field == SCORE_FIELD
    }
}

impl Default for SortBy {
    fn default() -> Self {
        SortBy {
            field: SCORE_FIELD.to_string(),
            order: SortOrder::Desc,
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            SortOrder::Desc => write!(f, "-{}", self.field),
            SortOrder::Asc => write!(f, "{}", self.field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsOptions {
    pub field: String,
    #[serde(default = "default_bucket_size")]
    pub size: usize,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

fn default_bucket_size() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub name: String,
    #[serde(default)]
    pub from: Option<f64>,
    #[serde(default)]
    pub to: Option<f64>,
}

impl NumericRange {
    /// Half-open: `from <= value < to`.
    pub fn contains(&self, value: f64) -> bool {
        self.from.map_or(true, |from| value >= from) && self.to.map_or(true, |to| value < to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeOptions {
    pub field: String,
    pub ranges: Vec<NumericRange>,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricOptions {
    pub field: String,
}

/// One named aggregation in a search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum AggregationRequest {
    Terms(TermsOptions),
    Range(RangeOptions),
    Sum(MetricOptions),
    Min(MetricOptions),
    Max(MetricOptions),
    Avg(MetricOptions),
}

impl AggregationRequest {
    pub fn field(&self) -> &str {
        match self {
            AggregationRequest::Terms(o) => &o.field,
            AggregationRequest::Range(o) => &o.field,
            AggregationRequest::Sum(o)
            | AggregationRequest::Min(o)
            | AggregationRequest::Max(o)
            | AggregationRequest::Avg(o) => &o.field,
        }
    }

    /// Bucket limit applied after merging, if any.
    pub fn size(&self) -> Option<usize> {
        match self {
            AggregationRequest::Terms(o) => Some(o.size),
            AggregationRequest::Range(o) => o.size,
            _ => None,
        }
    }
}

/// Aggregation result: bucket name → value, in presentation order.
///
/// Metric aggregations report a single `value` bucket once finalized; while
/// partial, `avg` carries `sum` and `count` so merging stays exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResponse {
    pub buckets: IndexMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub index_name: IndexName,
    /// Empty for a root request. Populated only on forwarded requests,
    /// which are executed locally and never re-routed.
    #[serde(default)]
    pub shard_names: Vec<ShardName>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default = "default_num")]
    pub num: usize,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggregationRequest>,
}

fn default_num() -> usize {
    DEFAULT_NUM
}

fn default_sort_by() -> String {
    DEFAULT_SORT_BY.to_string()
}

impl SearchRequest {
    pub fn new(index_name: impl Into<String>, query: impl Into<String>) -> Self {
        SearchRequest {
            index_name: index_name.into(),
            shard_names: Vec::new(),
            query: query.into(),
            start: 0,
            num: DEFAULT_NUM,
            sort_by: default_sort_by(),
            aggregations: BTreeMap::new(),
        }
    }

    pub fn sort(&self) -> SortBy {
        SortBy::parse(&self.sort_by)
    }

    pub fn is_root(&self) -> bool {
        self.shard_names.is_empty()
    }

    /// Request sent to one node during scatter: every partial must be a
    /// self-sufficient superset of the final page.
    pub fn for_shards(&self, shard_names: Vec<ShardName>) -> Self {
        SearchRequest {
            shard_names,
            start: 0,
            num: self.start.saturating_add(self.num),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: DocumentId,
    pub score: f64,
    /// Value of the sort field when sorting by a field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_value: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub index_name: IndexName,
    pub hits: u64,
    pub documents: Vec<SearchHit>,
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggregationResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_accepts_id_and_underscore_id() {
        let a = Document::from_json(&json!({"id": "a", "title": "x"})).unwrap();
        assert_eq!(a.id, "a");
        assert_eq!(a.fields.get("title"), Some(&json!("x")));
        assert!(!a.fields.contains_key("id"));

        let b = Document::from_json(&json!({"_id": "b"})).unwrap();
        assert_eq!(b.id, "b");
    }

    #[test]
    fn from_json_accepts_numeric_id() {
        let doc = Document::from_json(&json!({"id": 42, "n": 1})).unwrap();
        assert_eq!(doc.id, "42");
    }

    #[test]
    fn from_json_rejects_missing_id() {
        assert!(Document::from_json(&json!({"title": "x"})).is_err());
        assert!(Document::from_json(&json!({"id": ""})).is_err());
        assert!(Document::from_json(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn to_json_is_flat() {
        let doc = Document::new("a", json!({"price": 3.5}));
        assert_eq!(doc.to_json(), json!({"id": "a", "price": 3.5}));
    }

    #[test]
    fn sort_by_parse() {
        assert_eq!(SortBy::parse("-_score"), SortBy::default());
        assert!(SortBy::parse("").is_score());
        let asc = SortBy::parse("price");
        assert_eq!(asc.field, "price");
        assert_eq!(asc.order, SortOrder::Asc);
        let desc = SortBy::parse("-price");
        assert_eq!(desc.order, SortOrder::Desc);
        assert_eq!(desc.to_string(), "-price");
    }

    #[test]
    fn for_shards_rewrites_window() {
        let mut req = SearchRequest::new("products", "laptop");
        req.start = 20;
        req.num = 10;
        let derived = req.for_shards(vec!["shard-a".into()]);
        assert_eq!(derived.start, 0);
        assert_eq!(derived.num, 30);
        assert_eq!(derived.shard_names, vec!["shard-a".to_string()]);
        assert!(!derived.is_root());
        assert!(req.is_root());
    }

    #[test]
    fn search_request_defaults() {
        let req: SearchRequest = serde_json::from_value(json!({"index_name": "p"})).unwrap();
        assert_eq!(req.num, DEFAULT_NUM);
        assert_eq!(req.sort_by, "-_score");
        assert!(req.aggregations.is_empty());
    }

    #[test]
    fn aggregation_request_wire_form() {
        let agg: AggregationRequest = serde_json::from_value(json!({
            "type": "terms",
            "options": {"field": "tags", "size": 3}
        }))
        .unwrap();
        assert_eq!(agg.field(), "tags");
        assert_eq!(agg.size(), Some(3));

        let avg: AggregationRequest =
            serde_json::from_value(json!({"type": "avg", "options": {"field": "price"}})).unwrap();
        assert_eq!(avg.size(), None);
    }

    #[test]
    fn numeric_range_is_half_open() {
        let r = NumericRange {
            name: "cheap".into(),
            from: Some(0.0),
            to: Some(10.0),
        };
        assert!(r.contains(0.0));
        assert!(r.contains(9.99));
        assert!(!r.contains(10.0));
        let open = NumericRange {
            name: "any".into(),
            from: None,
            to: None,
        };
        assert!(open.contains(-1e9));
    }
}
