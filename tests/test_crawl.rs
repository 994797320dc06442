mod common;

use common::offer_json;
use jobdeck::crawler::Crawler;
use jobdeck::index::queue::IndexQueue;
use jobdeck::index::OfferIndex;
use jobdeck::indexer::Indexer;
use jobdeck::location::Location;
use jobdeck::store::Store;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ids_response(ids: &[&str]) -> serde_json::Value {
    json!({
        "resultats": ids
            .iter()
            .map(|id| json!({"@uriOffre": format!("/offre.html?numeroOffre={}", id)}))
            .collect::<Vec<_>>()
    })
}

async fn mount_search_page(server: &MockServer, ids: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/cms/webservices/rechercheOffre/ids"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ids_response(ids)))
        .mount(server)
        .await;
}

async fn mount_offer(server: &MockServer, id: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path("/cms/webservices/offre/public"))
        .and(query_param("numeroOffre", id))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(server)
        .await;
}

async fn mount_missing_offer(server: &MockServer, id: &str) {
    Mock::given(method("GET"))
        .and(path("/cms/webservices/offre/public"))
        .and(query_param("numeroOffre", id))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crawl_then_index() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("offers")).unwrap());

    // "b" is already stored; "c" vanishes remotely between list and fetch.
    store
        .put("b", &offer_json("b", "Ops", "<p>linux</p>", "Lyon"))
        .unwrap();
    mount_search_page(&server, &["a", "b", "c"]).await;
    mount_offer(&server, "a", offer_json("a", "Dev", "<p>rust</p>", "Paris")).await;
    mount_missing_offer(&server, "c").await;

    let crawler = Crawler::new(&server.uri(), 50, vec![]);
    let stats = crawler.run(store.clone()).await.unwrap();
    assert_eq!(stats.added, 1);
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.total, 2);
    assert!(store.has("a").unwrap());
    assert!(store.has("b").unwrap());
    assert!(store.list_deleted_ids().unwrap().is_empty());

    // The stored payload is the verbatim remote response.
    assert_eq!(
        store.get("a").unwrap().unwrap(),
        offer_json("a", "Dev", "<p>rust</p>", "Paris")
    );

    // Online indexing converges on exactly the stored ids.
    let index = Arc::new(OfferIndex::open_or_create(&dir.path().join("index")).unwrap());
    let queue = Arc::new(IndexQueue::open(&dir.path().join("queue")).unwrap());
    let indexer = Indexer::new(store.clone(), index.clone(), queue.clone()).unwrap();
    indexer.sync();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut ids = index.list_ids().unwrap();
        ids.sort();
        if ids == vec!["a".to_string(), "b".to_string()] {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "indexer did not converge, got {:?}",
            ids
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(queue.size().unwrap(), 0);
    indexer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn crawl_soft_deletes_unlisted_offers() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("offers")).unwrap());

    let payload_b = offer_json("b", "Ops", "<p>linux</p>", "Lyon");
    store
        .put("a", &offer_json("a", "Dev", "<p>rust</p>", "Paris"))
        .unwrap();
    store.put("b", &payload_b).unwrap();
    let loc = Location {
        city: "Lyon".to_string(),
        lat: 45.75,
        lon: 4.85,
        ..Location::default()
    };
    store
        .put_location("b", Some(&loc), chrono::Utc::now())
        .unwrap();

    // The remote now only lists "a".
    mount_search_page(&server, &["a"]).await;

    let crawler = Crawler::new(&server.uri(), 50, vec![]);
    let stats = crawler.run(store.clone()).await.unwrap();
    assert_eq!(stats.added, 0);
    assert_eq!(stats.deleted, 1);
    assert_eq!(store.size().unwrap(), 1);

    assert_eq!(store.list_deleted_ids().unwrap(), vec!["b".to_string()]);
    let journal = store.list_deleted_offers("b").unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(
        store.get_deleted(journal[0].id).unwrap().unwrap(),
        payload_b
    );
    // The cached location went away with the live record.
    assert_eq!(store.get_location("b").unwrap(), (None, None));
}

#[tokio::test(flavor = "multi_thread")]
async fn crawl_retries_transient_failures() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("offers")).unwrap());

    mount_search_page(&server, &["a"]).await;
    // Two failures, then success: within the retry budget.
    Mock::given(method("GET"))
        .and(path("/cms/webservices/offre/public"))
        .and(query_param("numeroOffre", "a"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_offer(&server, "a", offer_json("a", "Dev", "<p>rust</p>", "Paris")).await;

    let crawler =
        Crawler::new(&server.uri(), 50, vec![]).with_retry(Duration::from_millis(10), 5);
    let stats = crawler.run(store.clone()).await.unwrap();
    assert_eq!(stats.added, 1);
    assert!(store.has("a").unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn crawl_gives_up_after_retry_budget() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("offers")).unwrap());

    mount_search_page(&server, &["a"]).await;
    Mock::given(method("GET"))
        .and(path("/cms/webservices/offre/public"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let crawler =
        Crawler::new(&server.uri(), 50, vec![]).with_retry(Duration::from_millis(10), 2);
    let err = crawler.run(store.clone()).await.unwrap_err();
    assert!(matches!(err, jobdeck::JobdeckError::HttpFetch { .. }));
    // Nothing was stored and nothing was deleted.
    assert_eq!(store.size().unwrap(), 0);
    assert!(store.list_deleted_ids().unwrap().is_empty());
}
