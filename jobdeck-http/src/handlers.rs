use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jobdeck::geocoder::Geocoder;
use jobdeck::index::OfferIndex;
use jobdeck::indexer::Indexer;
use jobdeck::offer::{convert_offer, decode_offer};
use jobdeck::query::find_offers;
use jobdeck::spatial::{SpatialIndex, SpatialIndexer};
use jobdeck::store::Store;
use jobdeck::types::sort_dated_offers;
use jobdeck::JobdeckError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_DISPLAYED: usize = 1000;

pub struct AppState {
    pub store: Arc<Store>,
    pub index: Arc<OfferIndex>,
    pub spatial: Arc<SpatialIndex>,
    pub geocoder: Arc<Geocoder>,
    pub indexer: Indexer,
    pub spatial_indexer: SpatialIndexer,
}

pub struct ApiError(JobdeckError);

impl From<JobdeckError> for ApiError {
    fn from(e: JobdeckError) -> ApiError {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({"error": self.0.to_string()}));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default, rename = "where")]
    pub location: String,
}

#[derive(Debug, Serialize)]
pub struct OfferRow {
    pub id: String,
    pub title: String,
    pub account: String,
    pub date: String,
    pub salary: String,
    pub location: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub total: usize,
    pub displayed: usize,
    pub offers: Vec<OfferRow>,
}

fn format_salary(min: i32, max: i32) -> String {
    if min <= 0 {
        return String::new();
    }
    if max != min {
        format!("({} - {} kEUR)", min, max)
    } else {
        format!("({} kEUR)", min)
    }
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let mut hits = find_offers(
        &state.index,
        &state.spatial,
        &state.geocoder,
        &params.q,
        &params.location,
    )?;
    sort_dated_offers(&mut hits);
    tracing::info!(
        "query {:?} where {:?} returned {} entries",
        params.q,
        params.location,
        hits.len()
    );

    let total = hits.len();
    let mut offers = Vec::new();
    for hit in hits {
        if offers.len() >= MAX_DISPLAYED {
            break;
        }
        let data = match state.store.get(&hit.id)? {
            Some(d) => d,
            // The index can be briefly ahead of the store.
            None => continue,
        };
        let offer = match decode_offer(&data).and_then(|js| convert_offer(&js)) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("cannot convert offer {}: {}", hit.id, e);
                continue;
            }
        };
        offers.push(OfferRow {
            id: offer.id,
            title: offer.title,
            account: offer.account,
            date: offer.date.format("%Y-%m-%d").to_string(),
            salary: format_salary(offer.min_salary, offer.max_salary),
            location: offer.location,
            url: offer.url,
        });
    }
    Ok(Json(SearchResponse {
        total,
        displayed: offers.len(),
        offers,
    }))
}

pub async fn sync(State(state): State<Arc<AppState>>) -> &'static str {
    state.indexer.sync();
    state.spatial_indexer.sync();
    "OK"
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let offers = state.store.size()?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "offers": offers,
        "spatially_indexed": state.spatial.len(),
    })))
}
