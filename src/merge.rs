//! Scatter-gather result merging.
//!
//! Partial responses arrive already sorted by the request's sort key. They
//! are folded pairwise with a linear two-pointer merge, hit counts and
//! aggregation buckets are summed, and only the root applies pagination and
//! turns partial aggregation state into final values.

use crate::types::{
    AggregationRequest, AggregationResponse, SearchHit, SearchRequest, SearchResponse, SortBy,
    SortOrder,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const SUM_BUCKET: &str = "sum";
pub const COUNT_BUCKET: &str = "count";
pub const MIN_BUCKET: &str = "min";
pub const MAX_BUCKET: &str = "max";
pub const VALUE_BUCKET: &str = "value";

fn sort_key(hit: &SearchHit, sort: &SortBy) -> Option<f64> {
    if sort.is_score() {
        Some(hit.score)
    } else {
        hit.sort_value
    }
}

/// Ordering of two hits under `sort`: `Less` means `a` ranks first. Hits
/// without a sort value rank last; equal keys fall back to id ascending.
pub fn compare_hits(a: &SearchHit, b: &SearchHit, sort: &SortBy) -> Ordering {
    let by_key = match (sort_key(a, sort), sort_key(b, sort)) {
        (Some(x), Some(y)) => match sort.order {
            SortOrder::Desc => y.total_cmp(&x),
            SortOrder::Asc => x.total_cmp(&y),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_key.then_with(|| a.id.cmp(&b.id))
}

/// Merge two sorted hit lists into one sorted list of at most `limit` hits.
pub fn merge_hits(
    a: Vec<SearchHit>,
    b: Vec<SearchHit>,
    sort: &SortBy,
    limit: usize,
) -> Vec<SearchHit> {
    let mut out = Vec::with_capacity((a.len() + b.len()).min(limit));
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    while out.len() < limit {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => compare_hits(x, y, sort) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        match next {
            Some(hit) => out.push(hit),
            None => break,
        }
    }
    out
}

fn merge_aggregation(
    request: Option<&AggregationRequest>,
    into: &mut AggregationResponse,
    from: AggregationResponse,
) {
    for (bucket, value) in from.buckets {
        match into.buckets.get_mut(&bucket) {
            Some(current) => {
                *current = match request {
                    Some(AggregationRequest::Min(_)) => current.min(value),
                    Some(AggregationRequest::Max(_)) => current.max(value),
                    _ => *current + value,
                }
            }
            None => {
                into.buckets.insert(bucket, value);
            }
        }
    }
}

/// Combine partial responses for the same request. Hit lists are truncated
/// to `start + num`; aggregations stay partial.
pub fn merge_responses(request: &SearchRequest, responses: Vec<SearchResponse>) -> SearchResponse {
    let sort = request.sort();
    let limit = request.start.saturating_add(request.num);
    let mut merged = SearchResponse {
        index_name: request.index_name.clone(),
        ..Default::default()
    };
    for response in responses {
        merged.hits += response.hits;
        let documents = std::mem::take(&mut merged.documents);
        merged.documents = merge_hits(documents, response.documents, &sort, limit);
        for (name, partial) in response.aggregations {
            let agg = merged.aggregations.entry(name.clone()).or_default();
            merge_aggregation(request.aggregations.get(&name), agg, partial);
        }
    }
    merged
}

fn finalize_aggregation(request: &AggregationRequest, partial: AggregationResponse) -> AggregationResponse {
    let mut buckets = partial.buckets;
    match request {
        AggregationRequest::Terms(_) | AggregationRequest::Range(_) => {
            buckets.sort_by(|k1, v1, k2, v2| v2.total_cmp(v1).then_with(|| k1.cmp(k2)));
            if let Some(size) = request.size() {
                buckets.truncate(size);
            }
        }
        AggregationRequest::Sum(_) => {
            let sum = buckets.get(SUM_BUCKET).copied().unwrap_or(0.0);
            buckets.clear();
            buckets.insert(VALUE_BUCKET.to_string(), sum);
        }
        AggregationRequest::Min(_) | AggregationRequest::Max(_) => {
            let key = if matches!(request, AggregationRequest::Min(_)) {
                MIN_BUCKET
            } else {
                MAX_BUCKET
            };
            let value = buckets.get(key).copied();
            buckets.clear();
            if let Some(value) = value {
                buckets.insert(VALUE_BUCKET.to_string(), value);
            }
        }
        AggregationRequest::Avg(_) => {
            let sum = buckets.get(SUM_BUCKET).copied().unwrap_or(0.0);
            let count = buckets.get(COUNT_BUCKET).copied().unwrap_or(0.0);
            buckets.clear();
            if count > 0.0 {
                buckets.insert(VALUE_BUCKET.to_string(), sum / count);
            }
        }
    }
    AggregationResponse { buckets }
}

/// Root-only: apply `start`/`num` and finalize every aggregation.
pub fn finalize(request: &SearchRequest, mut response: SearchResponse) -> SearchResponse {
    response.documents = response
        .documents
        .into_iter()
        .skip(request.start)
        .take(request.num)
        .collect();

    let mut aggregations = BTreeMap::new();
    for (name, agg_request) in &request.aggregations {
        let partial = response.aggregations.remove(name).unwrap_or_default();
        aggregations.insert(name.clone(), finalize_aggregation(agg_request, partial));
    }
    response.aggregations = aggregations;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricOptions, TermsOptions};

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score,
            sort_value: None,
            timestamp: None,
            fields: serde_json::Map::new(),
        }
    }

    fn valued(id: &str, value: Option<f64>) -> SearchHit {
        SearchHit {
            sort_value: value,
            ..hit(id, 0.0)
        }
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    fn partial(hits: u64, docs: Vec<SearchHit>) -> SearchResponse {
        SearchResponse {
            index_name: "p".into(),
            hits,
            documents: docs,
            aggregations: BTreeMap::new(),
        }
    }

    #[test]
    fn merges_two_score_sorted_lists() {
        let a = vec![hit("a1", 9.0), hit("a2", 5.0), hit("a3", 1.0)];
        let b = vec![hit("b1", 7.0), hit("b2", 6.0)];
        let merged = merge_hits(a, b, &SortBy::default(), usize::MAX);
        assert_eq!(ids(&merged), vec!["a1", "b1", "b2", "a2", "a3"]);
    }

    #[test]
    fn merge_respects_limit() {
        let a = vec![hit("a1", 9.0), hit("a2", 5.0)];
        let b = vec![hit("b1", 7.0)];
        assert_eq!(ids(&merge_hits(a, b, &SortBy::default(), 2)), vec!["a1", "b1"]);
    }

    #[test]
    fn ties_break_by_id() {
        let a = vec![hit("m", 1.0)];
        let b = vec![hit("c", 1.0)];
        assert_eq!(ids(&merge_hits(a, b, &SortBy::default(), 10)), vec!["c", "m"]);
    }

    #[test]
    fn ascending_field_sort_puts_missing_last() {
        let sort = SortBy::parse("price");
        let a = vec![valued("a", Some(1.0)), valued("z", None)];
        let b = vec![valued("b", Some(2.0)), valued("c", Some(3.0))];
        assert_eq!(ids(&merge_hits(a, b, &sort, 10)), vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn descending_field_sort() {
        let sort = SortBy::parse("-price");
        let a = vec![valued("a", Some(3.0)), valued("b", Some(1.0))];
        let b = vec![valued("c", Some(2.0))];
        assert_eq!(ids(&merge_hits(a, b, &sort, 10)), vec!["a", "c", "b"]);
    }

    #[test]
    fn pagination_after_merge_matches_global_sort() {
        let all: Vec<SearchHit> = (0..40)
            .map(|i| hit(&format!("d{:02}", i), ((i * 37) % 41) as f64))
            .collect();
        let (left, right): (Vec<_>, Vec<_>) = all.iter().cloned().partition(|h| h.id < "d20".to_string());
        let sort = SortBy::default();
        let sorted = |mut v: Vec<SearchHit>| {
            v.sort_by(|a, b| compare_hits(a, b, &sort));
            v
        };

        let mut request = SearchRequest::new("p", "");
        request.start = 7;
        request.num = 9;
        let merged = merge_responses(
            &request,
            vec![partial(20, sorted(left)), partial(20, sorted(right))],
        );
        let page = finalize(&request, merged);

        let global: Vec<SearchHit> = sorted(all).into_iter().skip(7).take(9).collect();
        assert_eq!(ids(&page.documents), ids(&global));
        assert_eq!(page.hits, 40);
    }

    #[test]
    fn hits_sum_even_with_empty_partials() {
        let request = SearchRequest::new("p", "");
        let merged = merge_responses(
            &request,
            vec![partial(3, vec![hit("a", 1.0)]), partial(0, vec![]), partial(5, vec![hit("b", 2.0)])],
        );
        assert_eq!(merged.hits, 8);
        assert_eq!(ids(&merged.documents), vec!["b", "a"]);
    }

    fn with_agg(name: &str, buckets: &[(&str, f64)]) -> SearchResponse {
        let mut r = partial(0, vec![]);
        let mut agg = AggregationResponse::default();
        for (k, v) in buckets {
            agg.buckets.insert(k.to_string(), *v);
        }
        r.aggregations.insert(name.to_string(), agg);
        r
    }

    #[test]
    fn terms_buckets_sum_sort_and_truncate() {
        let mut request = SearchRequest::new("p", "");
        request.aggregations.insert(
            "brands".into(),
            AggregationRequest::Terms(TermsOptions {
                field: "brand".into(),
                size: 2,
                min_length: None,
                max_length: None,
            }),
        );
        let merged = merge_responses(
            &request,
            vec![
                with_agg("brands", &[("acme", 3.0), ("zeta", 1.0)]),
                with_agg("brands", &[("zeta", 3.0), ("beta", 4.0)]),
            ],
        );
        let done = finalize(&request, merged);
        let buckets: Vec<(&String, &f64)> = done.aggregations["brands"].buckets.iter().collect();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0], (&"beta".to_string(), &4.0));
        assert_eq!(buckets[1], (&"zeta".to_string(), &4.0));
    }

    #[test]
    fn metric_aggregations_merge_exactly() {
        let field = || MetricOptions { field: "price".into() };
        let mut request = SearchRequest::new("p", "");
        request.aggregations.insert("avg".into(), AggregationRequest::Avg(field()));
        request.aggregations.insert("min".into(), AggregationRequest::Min(field()));
        request.aggregations.insert("max".into(), AggregationRequest::Max(field()));
        request.aggregations.insert("sum".into(), AggregationRequest::Sum(field()));

        let mut a = with_agg("avg", &[(SUM_BUCKET, 10.0), (COUNT_BUCKET, 4.0)]);
        a.aggregations.extend(with_agg("min", &[(MIN_BUCKET, 2.0)]).aggregations);
        a.aggregations.extend(with_agg("max", &[(MAX_BUCKET, 9.0)]).aggregations);
        a.aggregations.extend(with_agg("sum", &[(SUM_BUCKET, 10.0)]).aggregations);
        let mut b = with_agg("avg", &[(SUM_BUCKET, 2.0), (COUNT_BUCKET, 2.0)]);
        b.aggregations.extend(with_agg("min", &[(MIN_BUCKET, 1.0)]).aggregations);
        b.aggregations.extend(with_agg("max", &[(MAX_BUCKET, 3.0)]).aggregations);
        b.aggregations.extend(with_agg("sum", &[(SUM_BUCKET, 2.0)]).aggregations);

        let done = finalize(&request, merge_responses(&request, vec![a, b]));
        assert_eq!(done.aggregations["avg"].buckets[VALUE_BUCKET], 2.0);
        assert_eq!(done.aggregations["min"].buckets[VALUE_BUCKET], 1.0);
        assert_eq!(done.aggregations["max"].buckets[VALUE_BUCKET], 9.0);
        assert_eq!(done.aggregations["sum"].buckets[VALUE_BUCKET], 12.0);
    }

    #[test]
    fn empty_metric_has_no_value() {
        let mut request = SearchRequest::new("p", "");
        request.aggregations.insert(
            "avg".into(),
            AggregationRequest::Avg(MetricOptions { field: "price".into() }),
        );
        let done = finalize(&request, merge_responses(&request, vec![partial(0, vec![])]));
        assert!(done.aggregations["avg"].buckets.is_empty());
    }
}
