use clap::{Parser, Subcommand};
use jobdeck::config::{geocoding_key, DataDirs, GEOCODING_KEY_VAR};
use jobdeck::crawler::{Crawler, DEFAULT_BASE_URL};
use jobdeck::error::JobdeckError;
use jobdeck::geocoder::{build_location, geocode_missing_locations, Geocoder};
use jobdeck::index::queue::IndexQueue;
use jobdeck::index::OfferIndex;
use jobdeck::indexer::diff_ids;
use jobdeck::location::fix_location;
use jobdeck::offer::{convert_offer, decode_offer};
use jobdeck::query::find_offers;
use jobdeck::spatial::{get_offer_location, SpatialIndex};
use jobdeck::store::{rebuild_offer_dates, Store};
use jobdeck::types::sort_dated_offers;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jobdeck", about = "APEC crawler, indexer and query tool")]
struct Cli {
    /// Root data directory
    #[arg(long, env = "JOBDECK_DATA_DIR", default_value = "./data", global = true)]
    data: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl remote offers into the store
    Crawl {
        /// Minimum salary in kEUR
        #[arg(long, default_value_t = 50)]
        min_salary: i32,
        /// Offer location codes
        #[arg(long = "location")]
        locations: Vec<i32>,
    },
    /// Geocode missing locations, then rebuild the text index
    Index {
        /// Maximum number of offers to add to the index (0 = no limit)
        #[arg(long, default_value_t = 0)]
        max_count: usize,
        /// Stop live geocoding when the remaining quota drops this low
        #[arg(long, default_value_t = 500)]
        min_quota: i64,
        /// Only geocode, skip the index rebuild
        #[arg(long)]
        no_index: bool,
    },
    /// Search stored offers
    Search {
        query: String,
        /// Location clause: place[,radius] or wgs84:lat,lon[,radius]
        #[arg(long = "where", default_value = "")]
        location: String,
    },
    /// Geocode one query and print the result
    Geocode { query: String },
    /// Serve the web frontend with online indexers
    Web {
        /// HTTP server address
        #[arg(long, default_value = "127.0.0.1:8081")]
        http: String,
    },
    /// Open every database, creating and stamping what is missing
    Upgrade,
    /// Print the soft-deletion journal
    DumpDeleted,
    /// Rebuild fingerprint records and print per-day offer changes
    Changes {
        /// Most recent day first
        #[arg(long)]
        reverse: bool,
    },
}

fn open_geocoder(dirs: &DataDirs) -> Result<Geocoder, JobdeckError> {
    let key = geocoding_key().unwrap_or_default();
    Geocoder::new(&key, &dirs.geocoder())
}

fn require_geocoding_key() -> Result<String, JobdeckError> {
    geocoding_key().ok_or_else(|| {
        JobdeckError::Config(format!(
            "geocoding key is not set, please configure {}",
            GEOCODING_KEY_VAR
        ))
    })
}

async fn crawl(dirs: &DataDirs, min_salary: i32, locations: Vec<i32>) -> Result<(), JobdeckError> {
    let store = Arc::new(Store::open(&dirs.store())?);
    let crawler = Crawler::new(DEFAULT_BASE_URL, min_salary, locations);
    let stats = crawler.run(store).await?;
    println!(
        "{} added, {} deleted, {} total",
        stats.added, stats.deleted, stats.total
    );
    Ok(())
}

async fn index(
    dirs: &DataDirs,
    max_count: usize,
    min_quota: i64,
    no_index: bool,
) -> Result<(), JobdeckError> {
    let store = Store::open(&dirs.store())?;
    match geocoding_key() {
        Some(key) => {
            let geocoder = Geocoder::new(&key, &dirs.geocoder())?;
            let stats = geocode_missing_locations(&store, &geocoder, min_quota).await?;
            println!(
                "{} geocoded, {} rejected{}",
                stats.resolved,
                stats.rejected,
                if stats.went_offline {
                    " (quota floor reached)"
                } else {
                    ""
                }
            );
        }
        None => tracing::warn!("{} is not set, skipping geocoding", GEOCODING_KEY_VAR),
    }
    if no_index {
        return Ok(());
    }

    let index = OfferIndex::open_or_create(&dirs.index())?;
    let mut writer = index.writer()?;
    let (mut added, removed) = diff_ids(store.list()?, index.list_ids()?);
    if max_count > 0 && added.len() > max_count {
        added.truncate(max_count);
    }
    for id in &removed {
        index.remove_offer(&mut writer, id);
    }
    let mut indexed = 0;
    for id in &added {
        let data = match store.get(id)? {
            Some(d) => d,
            None => continue,
        };
        let offer = match decode_offer(&data).and_then(|js| convert_offer(&js)) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("skipping undecodable offer {}: {}", id, e);
                continue;
            }
        };
        index.add_offer(&mut writer, &offer)?;
        indexed += 1;
        if indexed % 500 == 0 {
            println!("{} indexed", indexed);
        }
    }
    writer.commit()?;
    index.reader().reload()?;
    println!("{} indexed, {} removed", indexed, removed.len());
    Ok(())
}

fn print_offers(store: &Store, hits: Vec<jobdeck::DatedOffer>) -> Result<(), JobdeckError> {
    // Oldest first on a terminal, so the freshest end up under the cursor.
    let mut hits = hits;
    sort_dated_offers(&mut hits);
    hits.reverse();
    for hit in hits {
        let data = match store.get(&hit.id)? {
            Some(d) => d,
            None => continue,
        };
        let offer = match decode_offer(&data).and_then(|js| convert_offer(&js)) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("cannot convert offer {}: {}", hit.id, e);
                continue;
            }
        };
        println!(
            "{} {} {} {} ({})",
            offer.id,
            offer.title,
            offer.salary,
            offer.account,
            offer.date.format("%Y-%m-%d")
        );
        println!("    {}", offer.url);
    }
    Ok(())
}

async fn search(dirs: &DataDirs, query: &str, location: &str) -> Result<(), JobdeckError> {
    let store = Store::open(&dirs.store())?;
    let index = OfferIndex::open_or_create(&dirs.index())?;
    let geocoder = open_geocoder(dirs)?;
    let spatial = SpatialIndex::new();
    if !location.trim().is_empty() {
        for id in store.list()? {
            if let Some((date, lat, lon)) = get_offer_location(&store, &geocoder, &id)? {
                spatial.add(&id, date, lat, lon);
            }
        }
    }
    let hits = find_offers(&index, &spatial, &geocoder, query, location)?;
    println!("{} offers", hits.len());
    print_offers(&store, hits)
}

async fn geocode(dirs: &DataDirs, query: &str) -> Result<(), JobdeckError> {
    let key = require_geocoding_key()?;
    let geocoder = Geocoder::new(&key, &dirs.geocoder())?;
    for candidate in fix_location(query) {
        let reply = match geocoder.geocode(&candidate, "fr", false).await? {
            Some(r) => r,
            None => continue,
        };
        match build_location(&reply) {
            Some(location) => {
                println!("{} => {}", candidate, location);
                println!("    wgs84:{},{}", location.lat, location.lon);
                return Ok(());
            }
            None => println!("{} => no result", candidate),
        }
    }
    Ok(())
}

async fn web(dirs: &DataDirs, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(Store::open(&dirs.store())?);
    let index = Arc::new(OfferIndex::open_or_create(&dirs.index())?);
    let queue = Arc::new(IndexQueue::open(&dirs.queue())?);
    let geocoder = Arc::new(open_geocoder(dirs)?);
    jobdeck_http::serve(addr, store, index, queue, geocoder).await
}

fn upgrade(dirs: &DataDirs) -> Result<(), JobdeckError> {
    println!("upgrading store schema");
    let store = Store::upgrade(&dirs.store())?;
    println!("  store version {}", store.version()?);
    println!("upgrading geocoder cache");
    let geocoder = open_geocoder(dirs)?;
    println!("  geocoder version {}", geocoder.cache().version()?);
    IndexQueue::open(&dirs.queue())?;
    Ok(())
}

fn dump_deleted(dirs: &DataDirs) -> Result<(), JobdeckError> {
    let store = Store::open(&dirs.store())?;
    for id in store.list_deleted_ids()? {
        let dates: Vec<String> = store
            .list_deleted_offers(&id)?
            .into_iter()
            .map(|o| o.date)
            .collect();
        println!("{}: {}", id, dates.join(", "));
    }
    Ok(())
}

fn changes(dirs: &DataDirs, reverse: bool) -> Result<(), JobdeckError> {
    let store = Store::open(&dirs.store())?;
    let hashes = rebuild_offer_dates(&store)?;
    tracing::info!("{} fingerprints tracked", hashes);

    let mut per_day: std::collections::BTreeMap<String, (usize, usize)> =
        std::collections::BTreeMap::new();
    for id in store.list()? {
        let data = match store.get(&id)? {
            Some(d) => d,
            None => continue,
        };
        if let Ok(offer) = decode_offer(&data).and_then(|js| convert_offer(&js)) {
            per_day
                .entry(offer.date.format("%Y-%m-%d").to_string())
                .or_default()
                .0 += 1;
        }
    }
    for id in store.list_deleted_ids()? {
        for deleted in store.list_deleted_offers(&id)? {
            let date = chrono::DateTime::parse_from_rfc3339(&deleted.date)
                .map_err(|e| JobdeckError::Decode(format!("invalid deletion date: {}", e)))?;
            per_day
                .entry(date.format("%Y-%m-%d").to_string())
                .or_default()
                .1 += 1;
        }
    }
    let mut days: Vec<_> = per_day.into_iter().collect();
    if reverse {
        days.reverse();
    }
    for (day, (added, removed)) in days {
        println!("{}: +{}, -{} offers", day, added, removed);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dirs = DataDirs::new(&cli.data);
    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Command::Crawl {
            min_salary,
            locations,
        } => crawl(&dirs, min_salary, locations).await.map_err(Into::into),
        Command::Index {
            max_count,
            min_quota,
            no_index,
        } => index(&dirs, max_count, min_quota, no_index)
            .await
            .map_err(Into::into),
        Command::Search { query, location } => {
            search(&dirs, &query, &location).await.map_err(Into::into)
        }
        Command::Geocode { query } => geocode(&dirs, &query).await.map_err(Into::into),
        Command::Web { http } => web(&dirs, &http).await,
        Command::Upgrade => upgrade(&dirs).map_err(Into::into),
        Command::DumpDeleted => dump_deleted(&dirs).map_err(Into::into),
        Command::Changes { reverse } => changes(&dirs, reverse).map_err(Into::into),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
