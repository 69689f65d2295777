//! Query execution against the shard readers open on this node.

use super::ShardReader;
use crate::error::{GriddleError, Result};
use crate::mapping::{FieldType, ALL_FIELD, ID_FIELD, TIMESTAMP_FIELD};
use crate::merge::{self, COUNT_BUCKET, MAX_BUCKET, MIN_BUCKET, SUM_BUCKET};
use crate::metastore::IndexMetadata;
use crate::types::{
    AggregationRequest, AggregationResponse, SearchHit, SearchRequest, SearchResponse, SortBy,
    SortOrder,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::columnar::{Column, StrColumn};
use tantivy::query::{AllQuery, Query, QueryParser};
use tantivy::schema::OwnedValue;
use tantivy::tokenizer::TokenizerManager;
use tantivy::{DocAddress, DocId, Score, SegmentReader, TantivyDocument};
use tracing::debug;

fn is_match_all(query: &str) -> bool {
    let q = query.trim();
    q.is_empty() || q == "*"
}

/// Reject a request that no shard could execute: malformed query string,
/// unsortable sort field, or aggregation on an unsuitable field.
pub fn validate_request(meta: &IndexMetadata, request: &SearchRequest) -> Result<()> {
    let sort = request.sort();
    if !sort.is_score() {
        match meta.mapping.field_type(&sort.field) {
            Some(FieldType::Numeric) | Some(FieldType::Datetime) => {}
            _ => {
                return Err(GriddleError::InvalidQuery(format!(
                    "cannot sort by '{}': expected _score, {} or a numeric/datetime field",
                    sort.field, TIMESTAMP_FIELD
                )))
            }
        }
    }

    for (name, agg) in &request.aggregations {
        let field_type = meta.mapping.field_type(agg.field());
        let ok = agg.field() != TIMESTAMP_FIELD
            && match agg {
                AggregationRequest::Terms(_) => field_type == Some(FieldType::Keyword),
                _ => field_type == Some(FieldType::Numeric),
            };
        if !ok {
            return Err(GriddleError::InvalidQuery(format!(
                "aggregation '{}' cannot run on field '{}' ({:?})",
                name,
                agg.field(),
                field_type
            )));
        }
    }

    if !is_match_all(&request.query) {
        let schema = meta.mapping.to_tantivy();
        let field = schema.get_field(&meta.default_search_field).map_err(|_| {
            GriddleError::InvalidQuery(format!(
                "default search field '{}' is not in the schema",
                meta.default_search_field
            ))
        })?;
        QueryParser::new(schema, vec![field], TokenizerManager::default())
            .parse_query(&request.query)?;
    }
    Ok(())
}

fn build_query(reader: &ShardReader, query: &str) -> Result<Box<dyn Query>> {
    if is_match_all(query) {
        return Ok(Box::new(AllQuery));
    }
    let schema = reader.index().schema();
    let field_name = match reader.default_search_field() {
        "" => ALL_FIELD,
        name => name,
    };
    let field = schema.get_field(field_name).map_err(|_| {
        GriddleError::InvalidQuery(format!("default search field '{}' is not in the schema", field_name))
    })?;
    Ok(QueryParser::for_index(reader.index(), vec![field]).parse_query(query)?)
}

enum SortColumn {
    Missing,
    F64(Column<f64>),
    I64(Column<i64>),
    Date(Column<tantivy::DateTime>),
}

impl SortColumn {
    fn open(segment: &SegmentReader, field: &str, field_type: Option<FieldType>) -> Self {
        let fast = segment.fast_fields();
        let column = match field_type {
            _ if field == TIMESTAMP_FIELD => fast.column_opt::<i64>(field).ok().flatten().map(SortColumn::I64),
            Some(FieldType::Numeric) => fast.column_opt::<f64>(field).ok().flatten().map(SortColumn::F64),
            Some(FieldType::Datetime) => fast
                .column_opt::<tantivy::DateTime>(field)
                .ok()
                .flatten()
                .map(SortColumn::Date),
            _ => None,
        };
        column.unwrap_or(SortColumn::Missing)
    }

    fn value(&self, doc: DocId) -> Option<f64> {
        match self {
            SortColumn::Missing => None,
            SortColumn::F64(col) => col.first(doc),
            SortColumn::I64(col) => col.first(doc).map(|v| v as f64),
            SortColumn::Date(col) => col.first(doc).map(|d| d.into_timestamp_millis() as f64),
        }
    }
}

/// Rank key: higher ranks first. Missing values rank below everything.
fn rank_key(order: SortOrder, value: Option<f64>) -> f64 {
    match (order, value) {
        (_, None) => f64::NEG_INFINITY,
        (SortOrder::Desc, Some(v)) => v,
        (SortOrder::Asc, Some(v)) => -v,
    }
}

/// Rank key, then id ascending: the same order `merge::compare_hits` uses,
/// so equal keys are cut at the same place on every shard.
type Ranked = (f64, Reverse<String>, Option<f64>, Score);

fn doc_id(ids: Option<&StrColumn>, doc: DocId) -> String {
    let mut id = String::new();
    let Some(column) = ids else {
        return id;
    };
    if let Some(ord) = column.term_ords(doc).next() {
        if !matches!(column.ord_to_str(ord, &mut id), Ok(true)) {
            id.clear();
        }
    }
    id
}

fn top_docs(
    reader: &ShardReader,
    searcher: &tantivy::Searcher,
    query: &dyn Query,
    sort: &SortBy,
    limit: usize,
) -> Result<(usize, Vec<(Ranked, DocAddress)>)> {
    if limit == 0 {
        return Ok((searcher.search(query, &Count)?, Vec::new()));
    }
    let order = sort.order;
    let sort_field = (!sort.is_score()).then(|| {
        let field_type = reader.converter().mapping().field_type(&sort.field);
        (sort.field.clone(), field_type)
    });
    let collector = TopDocs::with_limit(limit).tweak_score(move |segment: &SegmentReader| {
        let column = sort_field
            .as_ref()
            .map(|(name, field_type)| SortColumn::open(segment, name, *field_type));
        let ids = segment.fast_fields().str(ID_FIELD).ok().flatten();
        move |doc: DocId, score: Score| -> Ranked {
            let value = match &column {
                Some(column) => column.value(doc),
                None => Some(score as f64),
            };
            (rank_key(order, value), Reverse(doc_id(ids.as_ref(), doc)), value, score)
        }
    });
    Ok(searcher.search(query, &(Count, collector))?)
}

fn stored_str(doc: &TantivyDocument, field: tantivy::schema::Field) -> Option<String> {
    let owned: OwnedValue = doc.get_first(field)?.into();
    match owned {
        OwnedValue::Str(s) => Some(s),
        _ => None,
    }
}

fn stored_i64(doc: &TantivyDocument, field: tantivy::schema::Field) -> Option<i64> {
    let owned: OwnedValue = doc.get_first(field)?.into();
    match owned {
        OwnedValue::I64(v) => Some(v),
        _ => None,
    }
}

/// Execute `request` against one shard. The result is a partial: at most
/// `start + num` hits and unfinalized aggregations.
pub fn search_shard(reader: &ShardReader, request: &SearchRequest) -> Result<SearchResponse> {
    let searcher = reader.reader().searcher();
    let query = build_query(reader, &request.query)?;
    let sort = request.sort();
    let limit = request.start.saturating_add(request.num);

    let (count, ranked) = top_docs(reader, &searcher, query.as_ref(), &sort, limit)?;

    let converter = reader.converter();
    let mut documents = Vec::with_capacity(ranked.len());
    for ((_, _, sort_value, score), address) in ranked {
        let doc: TantivyDocument = searcher.doc(address)?;
        let Some(id) = stored_str(&doc, converter.id_field()) else {
            continue;
        };
        let fields = match stored_str(&doc, converter.source_field()) {
            Some(source) => match serde_json::from_str(&source)? {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            None => serde_json::Map::new(),
        };
        documents.push(SearchHit {
            id,
            score: score as f64,
            sort_value: if sort.is_score() { None } else { sort_value },
            timestamp: stored_i64(&doc, converter.timestamp_field()),
            fields,
        });
    }

    let aggregations = if request.aggregations.is_empty() {
        BTreeMap::new()
    } else {
        let matched = searcher.search(query.as_ref(), &DocSetCollector)?;
        aggregate(&searcher, &matched, &request.aggregations)?
    };

    debug!(
        "[SEARCH {}/{}] query={:?} hits={} returned={}",
        reader.index_name(),
        reader.shard_name(),
        request.query,
        count,
        documents.len()
    );
    Ok(SearchResponse {
        index_name: request.index_name.clone(),
        hits: count as u64,
        documents,
        aggregations,
    })
}

fn aggregate(
    searcher: &tantivy::Searcher,
    matched: &HashSet<DocAddress>,
    requests: &BTreeMap<String, AggregationRequest>,
) -> Result<BTreeMap<String, AggregationResponse>> {
    let mut by_segment: BTreeMap<u32, Vec<DocId>> = BTreeMap::new();
    for address in matched {
        by_segment
            .entry(address.segment_ord)
            .or_default()
            .push(address.doc_id);
    }

    let mut out = BTreeMap::new();
    for (name, request) in requests {
        let response = match request {
            AggregationRequest::Terms(opts) => {
                let mut counts: BTreeMap<String, f64> = BTreeMap::new();
                let mut term = String::new();
                for (segment_ord, docs) in &by_segment {
                    let segment = searcher.segment_reader(*segment_ord);
                    let Some(column) = segment.fast_fields().str(&opts.field)? else {
                        continue;
                    };
                    for doc in docs {
                        let mut seen = HashSet::new();
                        for ord in column.term_ords(*doc) {
                            term.clear();
                            if !seen.insert(ord) || !column.ord_to_str(ord, &mut term)? {
                                continue;
                            }
                            let len = term.chars().count();
                            if opts.min_length.is_some_and(|min| len < min)
                                || opts.max_length.is_some_and(|max| len > max)
                            {
                                continue;
                            }
                            *counts.entry(term.clone()).or_default() += 1.0;
                        }
                    }
                }
                AggregationResponse {
                    buckets: counts.into_iter().collect(),
                }
            }
            AggregationRequest::Range(opts) => {
                let mut counts = vec![0.0; opts.ranges.len()];
                for_each_value(searcher, &by_segment, &opts.field, |values| {
                    for (i, range) in opts.ranges.iter().enumerate() {
                        if values.iter().any(|v| range.contains(*v)) {
                            counts[i] += 1.0;
                        }
                    }
                })?;
                AggregationResponse {
                    buckets: opts
                        .ranges
                        .iter()
                        .zip(counts)
                        .map(|(r, c)| (r.name.clone(), c))
                        .collect(),
                }
            }
            AggregationRequest::Sum(opts) | AggregationRequest::Avg(opts) => {
                let (mut sum, mut count) = (0.0, 0.0);
                for_each_value(searcher, &by_segment, &opts.field, |values| {
                    for v in values {
                        sum += v;
                        count += 1.0;
                    }
                })?;
                let mut response = AggregationResponse::default();
                response.buckets.insert(SUM_BUCKET.to_string(), sum);
                if matches!(request, AggregationRequest::Avg(_)) {
                    response.buckets.insert(COUNT_BUCKET.to_string(), count);
                }
                response
            }
            AggregationRequest::Min(opts) | AggregationRequest::Max(opts) => {
                let is_min = matches!(request, AggregationRequest::Min(_));
                let mut best: Option<f64> = None;
                for_each_value(searcher, &by_segment, &opts.field, |values| {
                    for v in values {
                        best = Some(match best {
                            None => *v,
                            Some(b) if is_min => b.min(*v),
                            Some(b) => b.max(*v),
                        });
                    }
                })?;
                let mut response = AggregationResponse::default();
                if let Some(best) = best {
                    let key = if is_min { MIN_BUCKET } else { MAX_BUCKET };
                    response.buckets.insert(key.to_string(), best);
                }
                response
            }
        };
        out.insert(name.clone(), response);
    }
    Ok(out)
}

/// Call `f` with the numeric values of every matched document that has any.
fn for_each_value(
    searcher: &tantivy::Searcher,
    by_segment: &BTreeMap<u32, Vec<DocId>>,
    field: &str,
    mut f: impl FnMut(&[f64]),
) -> Result<()> {
    let mut values = Vec::new();
    for (segment_ord, docs) in by_segment {
        let segment = searcher.segment_reader(*segment_ord);
        let Some(column) = segment.fast_fields().column_opt::<f64>(field)? else {
            continue;
        };
        for doc in docs {
            values.clear();
            values.extend(column.values_for_doc(*doc));
            if !values.is_empty() {
                f(&values);
            }
        }
    }
    Ok(())
}

/// Search every reader and merge into one partial response.
pub async fn search_local(
    readers: Vec<Arc<ShardReader>>,
    request: SearchRequest,
) -> Result<SearchResponse> {
    tokio::task::spawn_blocking(move || {
        let partials = readers
            .iter()
            .map(|reader| search_shard(reader, &request))
            .collect::<Result<Vec<_>>>()?;
        Ok(merge::merge_responses(&request, partials))
    })
    .await
    .map_err(|e| GriddleError::Io(format!("search task failed: {}", e)))?
}
