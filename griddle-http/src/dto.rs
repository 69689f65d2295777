use griddle::metastore::IndexMetadata;
use griddle::types::{DEFAULT_NUM, DEFAULT_SORT_BY};
use griddle::{AggregationRequest, SearchRequest, ShardName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateIndexResponse {
    pub name: String,
    pub shards: Vec<ShardName>,
    pub default_search_field: String,
    pub mapping_version: i64,
}

impl From<&IndexMetadata> for CreateIndexResponse {
    fn from(meta: &IndexMetadata) -> Self {
        CreateIndexResponse {
            name: meta.name.clone(),
            shards: meta.shard_names(),
            default_search_field: meta.default_search_field.clone(),
            mapping_version: meta.mapping_version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteIndexResponse {
    pub name: String,
    pub deleted: bool,
}

/// Body of a public search. The index comes from the path, and public
/// searches are never shard-pinned.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
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

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            query: String::new(),
            start: 0,
            num: DEFAULT_NUM,
            sort_by: default_sort_by(),
            aggregations: BTreeMap::new(),
        }
    }
}

fn default_num() -> usize {
    DEFAULT_NUM
}

fn default_sort_by() -> String {
    DEFAULT_SORT_BY.to_string()
}

impl SearchParams {
    pub fn into_request(self, index_name: &str) -> SearchRequest {
        SearchRequest {
            query: self.query,
            start: self.start,
            num: self.num,
            sort_by: self.sort_by,
            aggregations: self.aggregations,
            ..SearchRequest::new(index_name, "")
        }
    }
}
