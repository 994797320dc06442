//! Crawler: enumerates remote offer ids page by page, fetches unknown
//! offers, and soft-deletes the stored offers the remote no longer lists.

use crate::error::{JobdeckError, Result};
use crate::store::Store;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const DEFAULT_BASE_URL: &str = "https://cadres.apec.fr";

const PAGE_SIZE: usize = 250;
/// Pages overlap to absorb offers inserted remotely while paginating.
const PAGE_OVERLAP: usize = 5;
const FETCH_BASE_DELAY: Duration = Duration::from_secs(5);
const FETCH_LOOPS: u32 = 5;

const USER_AGENT: &str = "Mozilla/4.0 (compatible; MSIE 7.0; Windows NT 6.0)";

#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlStats {
    pub added: usize,
    pub deleted: usize,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(rename = "resultats", default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "@uriOffre", default)]
    uri: String,
}

async fn retry<T, F, Fut>(op: F, base_delay: Duration, loops: u32) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut remaining = loops;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!("fetching failed with: {}", e);
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[derive(Clone)]
pub struct Crawler {
    client: reqwest::Client,
    base_url: String,
    min_salary: i32,
    locations: Vec<i32>,
    base_delay: Duration,
    loops: u32,
}

impl Crawler {
    pub fn new(base_url: &str, min_salary: i32, locations: Vec<i32>) -> Crawler {
        Crawler {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            min_salary,
            locations,
            base_delay: FETCH_BASE_DELAY,
            loops: FETCH_LOOPS,
        }
    }

    /// Override the retry schedule, for tests.
    pub fn with_retry(mut self, base_delay: Duration, loops: u32) -> Crawler {
        self.base_delay = base_delay;
        self.loops = loops;
        self
    }

    /// List one page of offer ids from the remote search endpoint.
    async fn search_offers(&self, start: usize, count: usize) -> Result<Vec<String>> {
        let url = format!("{}/cms/webservices/rechercheOffre/ids", self.base_url);
        let body = serde_json::json!({
            "activeFiltre": true,
            "fonctions": [],
            "lieux": self.locations,
            "motsCles": "",
            "niveauxExperience": [],
            "pagination": {"range": count, "startIndex": start},
            "salaireMinimum": self.min_salary,
            "salaireMaximum": 1000,
            "secteursActivite": [],
            "sorts": [{"direction": "DESCENDING", "type": "DATE"}],
            "typeClient": "CADRE",
            "typesContrat": [],
            "typesConvention": []
        });
        let results: SearchResults = retry(
            || async {
                let response = self
                    .client
                    .post(&url)
                    .header("User-Agent", USER_AGENT)
                    .json(&body)
                    .send()
                    .await?;
                if response.status() != reqwest::StatusCode::OK {
                    return Err(JobdeckError::HttpFetch {
                        url: url.clone(),
                        reason: format!("got {}", response.status()),
                    });
                }
                Ok(response.json().await?)
            },
            self.base_delay,
            self.loops,
        )
        .await?;

        let mut ids = Vec::with_capacity(results.results.len());
        for result in results.results {
            let id = result
                .uri
                .split_once("numeroOffre=")
                .map(|(_, id)| id.to_string())
                .ok_or_else(|| {
                    JobdeckError::Decode(format!("invalid offer identifier: {}", result.uri))
                })?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Fetch one offer payload. A 404 means the offer vanished remotely
    /// while crawling and yields `None`; other failures are retried with
    /// exponential back-off.
    async fn get_offer(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let url = format!(
            "{}/cms/webservices/offre/public?numeroOffre={}",
            self.base_url, id
        );
        retry(
            || async {
                let response = self
                    .client
                    .get(&url)
                    .header("User-Agent", USER_AGENT)
                    .send()
                    .await?;
                match response.status() {
                    reqwest::StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
                    reqwest::StatusCode::NOT_FOUND => Ok(None),
                    status => Err(JobdeckError::HttpFetch {
                        url: url.clone(),
                        reason: format!("got {}", status),
                    }),
                }
            },
            self.base_delay,
            self.loops,
        )
        .await
    }

    async fn list_ids(
        &self,
        batch_tx: mpsc::Sender<Vec<String>>,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut start = 0;
        loop {
            if *stop_rx.borrow() {
                tracing::warn!("listing interrupted");
                return Err(JobdeckError::HttpFetch {
                    url: self.base_url.clone(),
                    reason: "listing interrupted".to_string(),
                });
            }
            tracing::info!("fetching from {} to {}", start, start + PAGE_SIZE);
            let ids = self.search_offers(start, PAGE_SIZE).await?;
            start += PAGE_SIZE - PAGE_OVERLAP;
            let fresh: Vec<String> = ids
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            seen.extend(fresh.iter().cloned());
            if !fresh.is_empty() && batch_tx.send(fresh).await.is_err() {
                // The fetcher is gone; it closed the stop channel first.
                return Err(JobdeckError::HttpFetch {
                    url: self.base_url.clone(),
                    reason: "listing interrupted".to_string(),
                });
            }
            if ids.len() < PAGE_SIZE - PAGE_OVERLAP {
                break;
            }
        }
        Ok(seen)
    }

    async fn fetch_offers(
        &self,
        store: Arc<Store>,
        mut batch_rx: mpsc::Receiver<Vec<String>>,
        stop_tx: watch::Sender<bool>,
    ) -> Result<usize> {
        let mut added = 0;
        while let Some(batch) = batch_rx.recv().await {
            for id in batch {
                if store.has(&id)? {
                    continue;
                }
                tracing::info!("fetching {}", id);
                match self.get_offer(&id).await {
                    Ok(Some(data)) => {
                        store.put(&id, &data)?;
                        added += 1;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(None) => {
                        tracing::info!("offer {} vanished remotely, skipping", id);
                    }
                    Err(e) => {
                        // Tear the lister down with us.
                        let _ = stop_tx.send(true);
                        return Err(e);
                    }
                }
            }
        }
        Ok(added)
    }

    /// One crawl cycle: list, fetch, then soft-delete everything the remote
    /// stopped listing. Deletions only run when both tasks succeeded.
    pub async fn run(&self, store: Arc<Store>) -> Result<CrawlStats> {
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let lister = {
            let crawler = self.clone();
            tokio::spawn(async move { crawler.list_ids(batch_tx, stop_rx).await })
        };
        let fetcher = {
            let crawler = self.clone();
            let store = store.clone();
            tokio::spawn(async move { crawler.fetch_offers(store, batch_rx, stop_tx).await })
        };

        let (listed, fetched) = tokio::join!(lister, fetcher);
        let seen = listed.map_err(|e| JobdeckError::Io(e.to_string()))??;
        let added = fetched.map_err(|e| JobdeckError::Io(e.to_string()))??;

        let mut deleted = 0;
        let now = Utc::now();
        for id in store.list()? {
            if !seen.contains(&id) {
                tracing::info!("deleting {}", id);
                store.delete(&id, now)?;
                deleted += 1;
            }
        }
        let stats = CrawlStats {
            added,
            deleted,
            total: store.size()?,
        };
        tracing::info!(
            "{} added, {} deleted, {} total",
            stats.added,
            stats.deleted,
            stats.total
        );
        Ok(stats)
    }
}
