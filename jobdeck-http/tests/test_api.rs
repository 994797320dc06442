use jobdeck::geocoder::Geocoder;
use jobdeck::index::queue::IndexQueue;
use jobdeck::index::OfferIndex;
use jobdeck::indexer::Indexer;
use jobdeck::location::Location;
use jobdeck::offer::{convert_offer, decode_offer};
use jobdeck::spatial::{SpatialIndex, SpatialIndexer};
use jobdeck::store::Store;
use jobdeck_http::handlers::AppState;
use jobdeck_http::router;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn offer_json(id: &str, title: &str, html: &str, location: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "numeroOffre": id,
        "intitule": title,
        "datePublication": "2016-03-01T08:30:00.000+0000",
        "salaireTexte": "45 - 55 kEUR",
        "lieuTexte": location,
        "texteHtml": html,
        "nomCompteEtablissement": "ACME"
    }))
    .unwrap()
}

async fn spawn_server() -> (String, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("offers")).unwrap());
    let index = Arc::new(OfferIndex::open_or_create(&dir.path().join("index")).unwrap());
    let queue = Arc::new(IndexQueue::open(&dir.path().join("queue")).unwrap());
    let geocoder = Arc::new(Geocoder::new("", &dir.path().join("geocoder")).unwrap());
    let spatial = Arc::new(SpatialIndex::new());

    store
        .put("1", &offer_json("1", "Développeur Rust", "<p>backend</p>", "Paris"))
        .unwrap();
    store
        .put("2", &offer_json("2", "Chef de projet", "<p>pilotage</p>", "Lyon"))
        .unwrap();
    let mut writer = index.writer().unwrap();
    for id in ["1", "2"] {
        let data = store.get(id).unwrap().unwrap();
        let offer = convert_offer(&decode_offer(&data).unwrap()).unwrap();
        index.add_offer(&mut writer, &offer).unwrap();
    }
    writer.commit().unwrap();
    index.reader().reload().unwrap();
    // Release the writer lock before the indexer claims it.
    drop(writer);

    let paris = Location {
        city: "Paris".to_string(),
        lat: 48.8566,
        lon: 2.3522,
        ..Location::default()
    };
    geocoder.cache().put("paris-fr", b"{}", Some(&paris)).unwrap();
    spatial.add("1", chrono::Utc::now(), 48.8566, 2.3522);
    spatial.add("2", chrono::Utc::now(), 45.75, 4.85);

    let indexer = Indexer::new(store.clone(), index.clone(), queue).unwrap();
    let spatial_indexer = SpatialIndexer::new(store.clone(), spatial.clone(), geocoder.clone());
    let state = Arc::new(AppState {
        store,
        index,
        spatial,
        geocoder,
        indexer,
        spatial_indexer,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state, dir)
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_search() {
    let (base, _state, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["offers"], 2);

    let found: serde_json::Value = client
        .get(format!("{}/search?q=rust", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["total"], 1);
    assert_eq!(found["offers"][0]["id"], "1");
    assert_eq!(found["offers"][0]["salary"], "(45 - 55 kEUR)");
    assert_eq!(found["offers"][0]["date"], "2016-03-01");

    // Combined text and radius query.
    let found: serde_json::Value = client
        .get(format!("{}/search?q=rust&where=paris", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["total"], 1);

    // A radius clause alone filters spatially.
    let found: serde_json::Value = client
        .get(format!("{}/search?where=wgs84:45.75,4.85,10000", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["total"], 1);
    assert_eq!(found["offers"][0]["id"], "2");

    // Malformed location clauses map to 400.
    let response = client
        .get(format!("{}/search?where=a,b,c,d", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_picks_up_new_offers() {
    let (base, state, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    state
        .store
        .put("3", &offer_json("3", "Data engineer", "<p>spark</p>", "Paris"))
        .unwrap();

    let response = client.post(format!("{}/sync", base)).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "OK");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let found: serde_json::Value = client
            .get(format!("{}/search?q=spark", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if found["total"] == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "sync did not index the new offer");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
