mod common;

use common::{geocoding_json, geocoding_noresult_json, offer_json};
use jobdeck::geocoder::{build_location, geocode_missing_locations, Geocoder};
use jobdeck::store::Store;
use jobdeck::JobdeckError;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn second_lookup_never_goes_remote() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let geocoder = Geocoder::new("test-key", dir.path())
        .unwrap()
        .with_base_url(&server.uri());

    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .and(query_param("q", "paris"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(geocoding_json("Paris", 48.8566, 2.3522, 2000)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let first = geocoder.geocode("paris", "fr", false).await.unwrap().unwrap();
    assert!(!first.cached);
    let location = build_location(&first).unwrap();
    assert_eq!(location.city, "Paris");

    // Served from cache; the mock's expect(1) verifies no second call.
    let second = geocoder.geocode("paris", "fr", false).await.unwrap().unwrap();
    assert!(second.cached);

    let (cached, found) = geocoder.get_cached_location("paris", "fr").unwrap();
    assert!(found);
    assert_eq!(cached.unwrap().lat, 48.8566);

    // Offline lookups still read the cache but never the network.
    let offline = geocoder.geocode("paris", "fr", true).await.unwrap();
    assert!(offline.is_some());
    let miss = geocoder.geocode("marseille", "fr", true).await.unwrap();
    assert!(miss.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolvable_queries_are_cached_too() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let geocoder = Geocoder::new("test-key", dir.path())
        .unwrap()
        .with_base_url(&server.uri());

    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(geocoding_noresult_json()))
        .expect(1)
        .mount(&server)
        .await;

    let reply = geocoder.geocode("nowhere", "fr", false).await.unwrap().unwrap();
    assert!(build_location(&reply).is_none());

    let (cached, found) = geocoder.get_cached_location("nowhere", "fr").unwrap();
    assert!(found);
    assert!(cached.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_exhaustion_is_typed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let geocoder = Geocoder::new("test-key", dir.path())
        .unwrap()
        .with_base_url(&server.uri());

    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .respond_with(ResponseTemplate::new(402))
        .mount(&server)
        .await;

    let err = geocoder.geocode("paris", "fr", false).await.unwrap_err();
    assert!(matches!(err, JobdeckError::Quota));
}

#[tokio::test(flavor = "multi_thread")]
async fn geocoding_pass_survives_quota_exhaustion() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("offers")).unwrap();
    let geocoder = Geocoder::new("test-key", &dir.path().join("geocoder"))
        .unwrap()
        .with_base_url(&server.uri());

    store
        .put("a", &offer_json("a", "Dev", "<p>rust</p>", "Paris"))
        .unwrap();
    store
        .put("b", &offer_json("b", "Ops", "<p>linux</p>", "Lyon"))
        .unwrap();

    // One resolvable answer, then the quota runs out.
    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .and(query_param("q", "paris"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(geocoding_json("Paris", 48.8566, 2.3522, 2000)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .and(query_param("q", "lyon"))
        .respond_with(ResponseTemplate::new(402))
        .mount(&server)
        .await;

    let stats = geocode_missing_locations(&store, &geocoder, 0).await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.rejected, 1);
    assert!(stats.went_offline);

    let (location, stamp) = store.get_location("a").unwrap();
    assert_eq!(location.unwrap().city, "Paris");
    assert!(stamp.is_some());
    // The quota hit left "b" unstamped, to be retried next run.
    assert_eq!(store.get_location("b").unwrap(), (None, None));
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_floor_flips_offline() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("offers")).unwrap();
    let geocoder = Geocoder::new("test-key", &dir.path().join("geocoder"))
        .unwrap()
        .with_base_url(&server.uri());

    store
        .put("a", &offer_json("a", "Dev", "<p>rust</p>", "Paris"))
        .unwrap();
    store
        .put("b", &offer_json("b", "Ops", "<p>linux</p>", "Lyon"))
        .unwrap();

    // The first live call reports a remaining quota under the floor; the
    // second offer must not trigger another call.
    Mock::given(method("GET"))
        .and(path("/geocode/v1/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(geocoding_json("Paris", 48.8566, 2.3522, 10)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stats = geocode_missing_locations(&store, &geocoder, 100).await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert!(stats.went_offline);
}
