mod common;

use common::{eventually, product_index, products, search_until, TestCluster, BOTH};
use griddle::types::{MetricOptions, TermsOptions};
use griddle::{AggregationRequest, Document, GriddleError, SearchRequest};
use griddle_cluster::{CreateIndexRequest, Role};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

fn match_all() -> SearchRequest {
    SearchRequest::new("products", "*")
}

#[tokio::test]
async fn membership_converges_across_nodes() {
    let cluster = TestCluster::start(3, 2).await;
    for node in &cluster.nodes {
        let names: BTreeSet<String> = node
            .membership()
            .members()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(
            names,
            BTreeSet::from(["node-0".to_string(), "node-1".into(), "node-2".into()])
        );
    }
}

#[tokio::test]
async fn every_node_computes_the_same_placement() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;

    let tables = assignment_tables(&cluster).await;
    assert!(tables.windows(2).all(|w| w[0] == w[1]));

    let table = &tables[0];
    for (shard, replicas) in &table.searchers["products"] {
        assert_eq!(replicas.len(), 2, "shard {} replicas", shard);
        assert!(table.indexer("products", shard).is_some());
    }
    assert_eq!(cluster.handle_counts("products").await, (4, 8));
}

async fn assignment_tables(cluster: &TestCluster) -> Vec<Arc<griddle_cluster::AssignmentTable>> {
    let mut tables = Vec::new();
    for node in &cluster.nodes {
        tables.push(node.assignments().await);
    }
    tables
}

#[tokio::test]
async fn root_writes_are_visible_from_every_node() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;

    let written = cluster.nodes[1]
        .add_documents("products", None, products(40))
        .await
        .unwrap();
    assert_eq!(written, 40);

    for node in &cluster.nodes {
        search_until(node, match_all(), 40).await;
    }

    // writes landed on more than one shard, each through its indexer
    let meta = cluster.nodes[0]
        .metastore()
        .get_index_metadata("products")
        .unwrap();
    let touched: Vec<&String> = meta
        .shards
        .iter()
        .filter(|(_, shard)| shard.version > meta.mapping_version)
        .map(|(name, _)| name)
        .collect();
    assert!(touched.len() > 1);
    let table = cluster.nodes[0].assignments().await;
    assert!(touched
        .iter()
        .all(|shard| table.indexer("products", shard).is_some()));
}

#[tokio::test]
async fn sorted_pages_agree_between_nodes() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;
    cluster.nodes[0]
        .add_documents("products", None, products(30))
        .await
        .unwrap();

    let mut request = match_all();
    request.sort_by = "-price".into();
    request.start = 5;
    request.num = 4;

    let mut pages = Vec::new();
    for node in &cluster.nodes {
        let resp = search_until(node, request.clone(), 30).await;
        let ids: Vec<String> = resp.documents.into_iter().map(|d| d.id).collect();
        pages.push(ids);
    }
    assert_eq!(pages[0], vec!["p024", "p023", "p022", "p021"]);
    assert!(pages.windows(2).all(|w| w[0] == w[1]));

    request.start = 28;
    let tail = search_until(&cluster.nodes[2], request, 30).await;
    assert_eq!(tail.documents.len(), 2);
}

#[tokio::test]
async fn aggregations_merge_across_shards() {
    let cluster = TestCluster::start(2, 1).await;
    cluster.nodes[0]
        .create_index("products", product_index(3))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 3).await;
    cluster.nodes[0]
        .add_documents("products", None, products(10))
        .await
        .unwrap();

    let mut request = match_all();
    request.aggregations = BTreeMap::from([
        (
            "brands".to_string(),
            AggregationRequest::Terms(TermsOptions {
                field: "brand".into(),
                size: 10,
                min_length: None,
                max_length: None,
            }),
        ),
        (
            "total".to_string(),
            AggregationRequest::Sum(MetricOptions {
                field: "price".into(),
            }),
        ),
        (
            "mean".to_string(),
            AggregationRequest::Avg(MetricOptions {
                field: "price".into(),
            }),
        ),
    ]);
    let resp = search_until(&cluster.nodes[1], request, 10).await;
    let brands = &resp.aggregations["brands"].buckets;
    assert_eq!(brands["acme"], 5.0);
    assert_eq!(brands["zed"], 5.0);
    assert_eq!(resp.aggregations["total"].buckets["value"], 45.0);
    assert_eq!(resp.aggregations["mean"].buckets["value"], 4.5);
}

#[tokio::test]
async fn root_delete_reaches_every_shard() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;
    cluster.nodes[0]
        .add_documents("products", None, products(20))
        .await
        .unwrap();
    search_until(&cluster.nodes[2], match_all(), 20).await;

    let ids: Vec<String> = (0..20).step_by(2).map(|i| format!("p{:03}", i)).collect();
    let deleted = cluster.nodes[1]
        .delete_documents("products", None, ids)
        .await
        .unwrap();
    assert_eq!(deleted, 10);

    let resp = search_until(&cluster.nodes[2], match_all(), 10).await;
    assert!(resp.documents.iter().all(|d| d.fields["brand"] == "zed"));
}

#[tokio::test]
async fn crashed_node_only_moves_its_own_shards() {
    let cluster = TestCluster::start(3, 1).await;
    cluster.nodes[0]
        .create_index("products", product_index(6))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 6).await;
    cluster.nodes[0]
        .add_documents("products", None, products(24))
        .await
        .unwrap();
    search_until(&cluster.nodes[0], match_all(), 24).await;

    let before = cluster.nodes[0].assignments().await;
    cluster.kill("node-2").await;
    cluster.wait_for_members(2).await;
    cluster.wait_for_placement("products", 6).await;

    let after = cluster.nodes[0].assignments().await;
    for (shard, replicas) in &before.searchers["products"] {
        let now = after.searchers("products", shard);
        if replicas.iter().any(|r| r == "node-2") {
            assert!(now.iter().all(|r| r != "node-2"));
        } else {
            assert_eq!(now, replicas.as_slice(), "shard {} moved needlessly", shard);
        }
    }

    for node in cluster.running() {
        search_until(&node, match_all(), 24).await;
    }

    // the surviving indexers take writes for every shard
    let more = products(30).split_off(24);
    let survivor = Arc::clone(&cluster.nodes[1]);
    eventually("writes after failover", || {
        let survivor = Arc::clone(&survivor);
        let more = more.clone();
        async move { survivor.add_documents("products", None, more).await.is_ok() }
    })
    .await;
    search_until(&cluster.nodes[0], match_all(), 30).await;
}

#[tokio::test]
async fn graceful_leave_is_seen_promptly() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[2].shutdown(Duration::from_secs(1)).await;
    cluster.wait_for_members(2).await;
    for node in cluster.running() {
        assert!(node
            .membership()
            .members()
            .iter()
            .all(|m| m.name != "node-2"));
    }
}

#[tokio::test]
async fn unreachable_replica_degrades_search() {
    let cluster = TestCluster::start(3, 1).await;
    cluster.nodes[0]
        .create_index("products", product_index(6))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 6).await;
    cluster.nodes[0]
        .add_documents("products", None, products(12))
        .await
        .unwrap();
    search_until(&cluster.nodes[0], match_all(), 12).await;

    // cut the link before membership notices: node-2's shards are skipped
    cluster.network.partition(&cluster.addr("node-2"));
    let resp = cluster.nodes[0].search(match_all()).await.unwrap();
    assert!(resp.hits <= 12);
}

#[tokio::test]
async fn delete_index_releases_handles_everywhere() {
    let cluster = TestCluster::start(3, 2).await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;

    cluster.nodes[2].delete_index("products").await.unwrap();
    let nodes = cluster.nodes.clone();
    eventually("handles released", || {
        let nodes = nodes.clone();
        async move {
            for node in &nodes {
                if !node.writers().is_empty().await || !node.readers().is_empty().await {
                    return false;
                }
            }
            true
        }
    })
    .await;

    let err = cluster.nodes[1].search(match_all()).await.unwrap_err();
    assert!(matches!(err, GriddleError::IndexNotFound(_)));
}

#[tokio::test]
async fn roles_split_writers_and_readers() {
    let cluster =
        TestCluster::start_with_roles(&[&[Role::Indexer], &[Role::Searcher], &[Role::Searcher]], 2)
            .await;
    cluster.nodes[1]
        .create_index("products", product_index(3))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 3).await;

    assert_eq!(cluster.nodes[0].writers().len().await, 3);
    assert!(cluster.nodes[0].readers().is_empty().await);
    for searcher in &cluster.nodes[1..] {
        assert!(searcher.writers().is_empty().await);
        assert_eq!(searcher.readers().len().await, 3);
    }

    cluster.nodes[2]
        .add_documents("products", None, products(9))
        .await
        .unwrap();
    search_until(&cluster.nodes[1], match_all(), 9).await;
}

#[tokio::test]
async fn writes_without_an_indexer_fail() {
    let cluster = TestCluster::start_with_roles(&[&[Role::Searcher], &[Role::Searcher]], 2).await;
    cluster.nodes[0]
        .create_index(
            "products",
            CreateIndexRequest {
                storage_uri: "mem://products".into(),
                num_shards: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    cluster.wait_for_placement("products", 2).await;

    let err = cluster.nodes[1]
        .add_documents("products", None, products(4))
        .await
        .unwrap_err();
    assert!(
        matches!(err, GriddleError::NoNodeAvailable { .. }),
        "unexpected error {:?}",
        err
    );
}

#[tokio::test]
async fn late_joiner_picks_up_existing_indexes() {
    let mut cluster = TestCluster::start(2, 3).await;
    cluster.nodes[0]
        .create_index("products", product_index(2))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 2).await;
    cluster.nodes[0]
        .add_documents("products", None, products(8))
        .await
        .unwrap();

    let joiner = cluster.add_node(BOTH).await;
    cluster.wait_for_members(3).await;
    cluster.wait_for_placement("products", 2).await;
    assert_eq!(joiner.readers().len().await, 2);
    search_until(&joiner, match_all(), 8).await;
}

/// Create two-shard indexes until one has its shards indexed by different
/// nodes; returns the index name and each shard's indexer.
async fn split_two_shard_index(cluster: &TestCluster) -> (String, BTreeMap<String, String>) {
    for attempt in 0..20 {
        let name = format!("products-{}", attempt);
        let request = CreateIndexRequest {
            storage_uri: format!("mem://{}", name),
            num_shards: 2,
            ..Default::default()
        };
        cluster.nodes[0].create_index(&name, request).await.unwrap();
        cluster.wait_for_placement(&name, 2).await;
        let table = cluster.nodes[0].assignments().await;
        let indexers = table.indexers[&name].clone();
        let owners: BTreeSet<&String> = indexers.values().collect();
        if owners.len() == 2 {
            return (name, indexers);
        }
        cluster.nodes[0].delete_index(&name).await.unwrap();
    }
    panic!("rendezvous never split two shards over two indexers");
}

#[tokio::test]
async fn root_write_splits_into_one_local_and_one_forwarded_batch() {
    let cluster = TestCluster::start(2, 2).await;
    let (index, indexers) = split_two_shard_index(&cluster).await;
    let metastore = cluster.nodes[0].metastore();

    // one document id per shard
    let mut by_shard: BTreeMap<String, String> = BTreeMap::new();
    for i in 0.. {
        let id = format!("doc-{}", i);
        let shard = metastore.get_responsible_shard(&index, &id).unwrap();
        by_shard.entry(shard).or_insert(id);
        if by_shard.len() == 2 {
            break;
        }
    }
    let docs: Vec<_> = by_shard
        .values()
        .map(|id| Document::new(id.clone(), json!({"title": "x"})))
        .collect();

    let before = metastore.get_index_metadata(&index).unwrap();
    let written = cluster.nodes[0]
        .add_documents(&index, None, docs)
        .await
        .unwrap();
    assert_eq!(written, 2);

    assert_eq!(cluster.network.forwarded_writes(&cluster.addr("node-1")), 1);
    assert_eq!(cluster.network.forwarded_writes(&cluster.addr("node-0")), 0);
    let after = metastore.get_index_metadata(&index).unwrap();
    for (shard, owner) in &indexers {
        assert!(
            after.shards[shard].version > before.shards[shard].version,
            "shard {} on {} was not bumped",
            shard,
            owner
        );
    }
}

#[tokio::test]
async fn killing_a_searcher_only_node_moves_only_its_replicas() {
    let cluster = TestCluster::start_with_roles(
        &[BOTH, &[Role::Searcher], &[Role::Searcher]],
        2,
    )
    .await;
    cluster.nodes[0]
        .create_index("products", product_index(4))
        .await
        .unwrap();
    cluster.wait_for_placement("products", 4).await;
    cluster.nodes[0]
        .add_documents("products", None, products(16))
        .await
        .unwrap();

    let before = cluster.nodes[0].assignments().await;
    for (shard, replicas) in &before.searchers["products"] {
        assert_eq!(before.indexer("products", shard), Some("node-0"));
        assert_eq!(replicas.len(), 2);
    }

    cluster.kill("node-2").await;
    cluster.wait_for_members(2).await;
    cluster.wait_for_placement("products", 4).await;

    let after = cluster.nodes[0].assignments().await;
    assert_eq!(after.indexers, before.indexers);
    for (shard, replicas) in &before.searchers["products"] {
        let now = after.searchers("products", shard);
        assert_eq!(now.len(), 2);
        if replicas.iter().any(|r| r == "node-2") {
            assert!(now.iter().all(|r| r != "node-2"));
            for kept in replicas.iter().filter(|r| *r != "node-2") {
                assert!(now.contains(kept), "shard {} lost surviving replica {}", shard, kept);
            }
        } else {
            assert_eq!(now, replicas.as_slice(), "shard {} moved needlessly", shard);
        }
    }
    search_until(&cluster.nodes[1], match_all(), 16).await;
}

#[tokio::test]
async fn local_commit_is_published_when_a_forward_fails() {
    let cluster = TestCluster::start(2, 2).await;
    let (index, indexers) = split_two_shard_index(&cluster).await;
    let metastore = Arc::clone(cluster.nodes[0].metastore());
    let local_shard = indexers
        .iter()
        .find(|(_, owner)| owner.as_str() == "node-0")
        .map(|(shard, _)| shard.clone())
        .unwrap();
    let before = metastore.get_shard_metadata(&index, &local_shard).unwrap().version;

    let docs = products(20);
    let local_docs = docs
        .iter()
        .filter(|doc| metastore.get_responsible_shard(&index, &doc.id).unwrap() == local_shard)
        .count();
    assert!(local_docs > 0);

    // the forward fails at once while the local commit is still running
    cluster.network.partition(&cluster.addr("node-1"));
    let err = cluster.nodes[0]
        .add_documents(&index, None, docs)
        .await
        .unwrap_err();
    assert!(matches!(err, GriddleError::Rpc(_)), "unexpected error {:?}", err);

    let shard = local_shard.clone();
    let index_name = index.clone();
    eventually("local shard version bump", || {
        let metastore = Arc::clone(&metastore);
        let (index, shard) = (index_name.clone(), shard.clone());
        async move {
            metastore
                .get_shard_metadata(&index, &shard)
                .map(|meta| meta.version > before)
                .unwrap_or(false)
        }
    })
    .await;

    let mut request = SearchRequest::new(index.as_str(), "*");
    request.shard_names = vec![local_shard];
    let node = Arc::clone(&cluster.nodes[0]);
    eventually("committed documents visible", || {
        let node = Arc::clone(&node);
        let request = request.clone();
        async move {
            node.search(request)
                .await
                .map(|resp| resp.hits == local_docs as u64)
                .unwrap_or(false)
        }
    })
    .await;
}
