//! Geocoding client: cache-first lookups against the OpenCage HTTP API,
//! with quota-aware offline fallback.

pub mod cache;

use crate::error::{JobdeckError, Result};
use crate::location::{fix_location, Location};
use crate::offer::JsonOffer;
use crate::store::Store;
use cache::Cache;
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.opencagedata.com";

/// Responses are capped: a geocoding answer has no business being bigger.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoRate {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub remaining: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoComponent {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub postcode: String,
    #[serde(default)]
    pub county: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoGeometry {
    pub lat: f64,
    #[serde(rename = "lng")]
    pub lon: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoResult {
    #[serde(default)]
    pub components: GeoComponent,
    #[serde(default)]
    pub geometry: Option<GeoGeometry>,
}

/// A decoded geocoding response, cached or live.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocodingReply {
    #[serde(skip)]
    pub cached: bool,
    #[serde(default)]
    pub rate: GeoRate,
    #[serde(default)]
    pub results: Vec<GeoResult>,
}

/// Flatten the best result of a reply into a [`Location`], if it has
/// coordinates.
pub fn build_location(reply: &GeocodingReply) -> Option<Location> {
    let first = reply.results.first()?;
    let geometry = first.geometry.as_ref()?;
    let c = &first.components;
    Some(Location {
        city: c.city.clone(),
        post_code: c.postcode.clone(),
        county: c.county.clone(),
        state: c.state.clone(),
        country: c.country.clone(),
        lat: geometry.lat,
        lon: geometry.lon,
    })
}

fn make_key(query: &str, country_code: &str) -> (String, String) {
    let code = country_code.trim().to_lowercase();
    let code = if code.is_empty() {
        "unk".to_string()
    } else {
        code
    };
    let key = format!("{}-{}", query.trim().to_lowercase(), code);
    (key, code)
}

pub struct Geocoder {
    key: String,
    cache: Cache,
    client: reqwest::Client,
    base_url: String,
}

impl Geocoder {
    pub fn new(key: &str, cache_dir: &Path) -> Result<Geocoder> {
        let cache = Cache::open(cache_dir)?;
        Ok(Geocoder {
            key: key.to_string(),
            cache,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at another endpoint, for tests.
    pub fn with_base_url(mut self, base_url: &str) -> Geocoder {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn geocode_from_cache(&self, query: &str, country_code: &str) -> Result<Option<GeocodingReply>> {
        let (key, _) = make_key(query, country_code);
        let data = match self.cache.get(&key)? {
            Some(d) if !d.is_empty() => d,
            _ => return Ok(None),
        };
        let mut reply: GeocodingReply = serde_json::from_slice(&data)?;
        reply.cached = true;
        Ok(Some(reply))
    }

    /// Cache-only lookup of a decoded location. Never goes remote.
    pub fn get_cached_location(
        &self,
        query: &str,
        country_code: &str,
    ) -> Result<(Option<Location>, bool)> {
        let (key, _) = make_key(query, country_code);
        self.cache.get_location(&key)
    }

    /// Resolve a query: cache first, then — unless `offline` — the remote
    /// provider. A successful live call persists the raw response and its
    /// decoded location, then pauses a second to respect the provider rate.
    pub async fn geocode(
        &self,
        query: &str,
        country_code: &str,
        offline: bool,
    ) -> Result<Option<GeocodingReply>> {
        if let Some(reply) = self.geocode_from_cache(query, country_code)? {
            return Ok(Some(reply));
        }
        if offline {
            return Ok(None);
        }
        let data = self.raw_geocode(query, country_code).await?;
        let reply: GeocodingReply = serde_json::from_slice(&data)?;
        let (key, _) = make_key(query, country_code);
        self.cache.put(&key, &data, build_location(&reply).as_ref())?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(Some(reply))
    }

    async fn raw_geocode(&self, query: &str, country_code: &str) -> Result<Vec<u8>> {
        let mut url = format!(
            "{}/geocode/v1/json?q={}&key={}",
            self.base_url,
            urlencoding::encode(query),
            urlencoding::encode(&self.key)
        );
        if !country_code.is_empty() {
            url += &format!("&countrycode={}", urlencoding::encode(country_code));
        }
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            if status == reqwest::StatusCode::PAYMENT_REQUIRED {
                return Err(JobdeckError::Quota);
            }
            return Err(JobdeckError::HttpFetch {
                url,
                reason: format!("geocoding failed with {}", status),
            });
        }
        let data = response.bytes().await?;
        if data.len() > MAX_RESPONSE_BYTES {
            return Err(JobdeckError::Decode("geocoding response too large".into()));
        }
        Ok(data.to_vec())
    }
}

/// Resolve an offer's free-form location against the cache only. Candidates
/// are tried in canonicalization order; the first resolvable one wins.
pub fn cached_offer_location(geocoder: &Geocoder, offer: &JsonOffer) -> Result<Option<Location>> {
    for candidate in fix_location(&offer.location) {
        let (location, _) = geocoder.get_cached_location(&candidate, "fr")?;
        if location.is_some() {
            return Ok(location);
        }
    }
    Ok(None)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GeocodeStats {
    pub resolved: usize,
    pub rejected: usize,
    pub went_offline: bool,
}

/// Geocode every stored offer lacking a resolved location, writing the
/// outcomes into the store's location cache. Quota exhaustion (or dropping
/// under `min_quota` remaining calls) flips the pass into cache-only mode
/// for the rest of the run.
pub async fn geocode_missing_locations(
    store: &Store,
    geocoder: &Geocoder,
    min_quota: i64,
) -> Result<GeocodeStats> {
    let mut stats = GeocodeStats::default();
    let mut offline = false;
    let ids = store.list()?;
    for (i, id) in ids.iter().enumerate() {
        let (location, _) = store.get_location(id)?;
        if location.is_some() {
            continue;
        }
        let data = match store.get(id)? {
            Some(d) => d,
            None => continue,
        };
        let offer = match crate::offer::decode_offer(&data) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("skipping offer {}: {}", id, e);
                continue;
            }
        };
        let mut found = None;
        let mut attempted_all = true;
        for candidate in fix_location(&offer.location) {
            let (cached, known) = geocoder.get_cached_location(&candidate, "fr")?;
            if cached.is_some() {
                found = cached;
                break;
            }
            if known {
                continue;
            }
            if offline {
                attempted_all = false;
                continue;
            }
            match geocoder.geocode(&candidate, "fr", false).await {
                Err(JobdeckError::Quota) => {
                    tracing::warn!("geocoding quota exhausted, continuing offline");
                    offline = true;
                    stats.went_offline = true;
                    attempted_all = false;
                    continue;
                }
                Err(e) => return Err(e),
                Ok(None) => continue,
                Ok(Some(reply)) => {
                    if reply.rate.remaining <= min_quota {
                        offline = true;
                        stats.went_offline = true;
                    }
                    let location = build_location(&reply);
                    tracing::info!(
                        "geocoding {}/{} {:?} => {:?} (quota: {}/{})",
                        i + 1,
                        ids.len(),
                        offer.location,
                        candidate,
                        reply.rate.remaining,
                        reply.rate.limit
                    );
                    if location.is_some() {
                        found = location;
                        break;
                    }
                }
            }
        }
        if found.is_some() {
            stats.resolved += 1;
            store.put_location(id, found.as_ref(), Utc::now())?;
        } else if attempted_all {
            // Every candidate is known unresolvable: stamp the failure so
            // readers can tell it apart from "never attempted".
            stats.rejected += 1;
            store.put_location(id, None, Utc::now())?;
        } else {
            stats.rejected += 1;
        }
    }
    Ok(stats)
}
