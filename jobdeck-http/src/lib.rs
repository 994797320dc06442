//! Thin HTTP surface over the jobdeck core: search, sync and health.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use handlers::AppState;
use jobdeck::geocoder::Geocoder;
use jobdeck::index::queue::IndexQueue;
use jobdeck::index::OfferIndex;
use jobdeck::indexer::Indexer;
use jobdeck::spatial::{SpatialIndex, SpatialIndexer};
use jobdeck::store::Store;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/search", get(handlers::search))
        .route("/sync", post(handlers::sync))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire the core components together, start both online indexers, and serve
/// until the process dies.
pub async fn serve(
    addr: &str,
    store: Arc<Store>,
    index: Arc<OfferIndex>,
    queue: Arc<IndexQueue>,
    geocoder: Arc<Geocoder>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spatial = Arc::new(SpatialIndex::new());
    let indexer = Indexer::new(store.clone(), index.clone(), queue)?;
    let spatial_indexer = SpatialIndexer::new(store.clone(), spatial.clone(), geocoder.clone());
    indexer.sync();
    spatial_indexer.sync();

    let state = Arc::new(AppState {
        store,
        index,
        spatial,
        geocoder,
        indexer,
        spatial_indexer,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("serving on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
