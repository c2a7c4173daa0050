//! JSON price-history store, cheapest-fare ranking and HTTP fetch utilities for farewatch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use farewatch_core::{FlightDocument, FlightObservation, PricePoint, DOCUMENT_DATETIME_FORMAT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "farewatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing flight documents: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of merging one observation into the document collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Created {
        key: String,
    },
    PriceAppended {
        key: String,
        previous: Option<f64>,
        price: f64,
    },
    Unchanged {
        key: String,
    },
}

impl ReconcileOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { key } => write!(f, "new flight {key} added"),
            Self::PriceAppended {
                key,
                previous: Some(previous),
                price,
            } => write!(f, "price for {key} changed {previous} -> {price}"),
            Self::PriceAppended {
                key,
                previous: None,
                price,
            } => write!(f, "price {price} recorded for {key}"),
            Self::Unchanged { key } => write!(f, "price for {key} already recorded"),
        }
    }
}

/// Merge `observation` into `documents` in place.
///
/// The first entry with the same (departure IATA, arrival IATA, departure) wins. A price that
/// already appears anywhere in that entry's history is not appended again; a new price is
/// stamped with `now`, not with the upstream "price updated" marker.
pub fn merge_observation(
    documents: &mut Vec<FlightDocument>,
    observation: &FlightObservation,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let key = observation.natural_key().to_string();
    let Some(existing) = documents.iter_mut().find(|doc| doc.matches(observation)) else {
        documents.push(FlightDocument::from_observation(observation));
        return ReconcileOutcome::Created { key };
    };

    if existing.has_price(observation.price()) {
        return ReconcileOutcome::Unchanged { key };
    }

    let previous = existing.latest_price();
    existing.push_price(
        PricePoint {
            timestamp: now.timestamp(),
            value: observation.price(),
        },
        observation.price_updated(),
    );
    ReconcileOutcome::PriceAppended {
        key,
        previous,
        price: observation.price(),
    }
}

/// Contents of the store file: entries that parse as [`FlightDocument`] plus the raw JSON of
/// those that do not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredCollection {
    pub documents: Vec<FlightDocument>,
    pub unreadable: Vec<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum StoredEntry<'a> {
    Document(&'a FlightDocument),
    Unreadable(&'a serde_json::Value),
}

/// Flat JSON array of [`FlightDocument`]s, rewritten whole on every mutation.
///
/// Single-process only: there is no file locking.
#[derive(Debug, Clone)]
pub struct JsonFlightStore {
    path: PathBuf,
}

impl JsonFlightStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the readable documents. A missing, empty or non-array file yields an empty
    /// collection; entries that do not parse are logged and left out.
    pub async fn load(&self) -> Vec<FlightDocument> {
        self.load_collection().await.documents
    }

    /// Load the file entry by entry, keeping the raw JSON of entries that do not parse.
    pub async fn load_collection(&self) -> StoredCollection {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "flight store not found, starting empty");
                return StoredCollection::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "reading flight store failed, treating as empty");
                return StoredCollection::default();
            }
        };

        if text.trim().is_empty() {
            warn!(path = %self.path.display(), "flight store is empty");
            return StoredCollection::default();
        }

        let entries = match serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "flight store is not a JSON array, treating as empty"
                );
                return StoredCollection::default();
            }
        };

        let mut collection = StoredCollection::default();
        for (index, entry) in entries.into_iter().enumerate() {
            match FlightDocument::deserialize(&entry) {
                Ok(document) => collection.documents.push(document),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        index,
                        error = %err,
                        "skipping unreadable flight entry"
                    );
                    collection.unreadable.push(entry);
                }
            }
        }
        debug!(
            path = %self.path.display(),
            count = collection.documents.len(),
            unreadable = collection.unreadable.len(),
            "loaded flight store"
        );
        collection
    }

    /// Replace the collection on disk via a temp file in the same directory and an atomic rename.
    pub async fn write_documents(&self, documents: &[FlightDocument]) -> Result<(), StoreError> {
        self.write_entries(documents, &[]).await
    }

    /// Unreadable entries are written back after the documents with their content unchanged.
    async fn write_entries(
        &self,
        documents: &[FlightDocument],
        unreadable: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        let entries: Vec<StoredEntry<'_>> = documents
            .iter()
            .map(StoredEntry::Document)
            .chain(unreadable.iter().map(StoredEntry::Unreadable))
            .collect();
        let bytes = serde_json::to_vec_pretty(&entries)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io("creating directory", &parent, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flights.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io("opening temp file", &temp_path, e))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("writing temp file", &temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("replacing", &self.path, err));
        }
        debug!(
            path = %self.path.display(),
            count = documents.len(),
            unreadable = unreadable.len(),
            bytes = bytes.len(),
            "flight store written"
        );
        Ok(())
    }

    pub async fn reconcile(
        &self,
        observation: &FlightObservation,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.reconcile_at(observation, Utc::now()).await
    }

    /// Read-modify-write; the file is only rewritten when the outcome mutates the collection.
    /// Entries that do not parse survive the rewrite.
    pub async fn reconcile_at(
        &self,
        observation: &FlightObservation,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let StoredCollection {
            mut documents,
            unreadable,
        } = self.load_collection().await;
        let outcome = merge_observation(&mut documents, observation, now);
        if outcome.is_mutation() {
            self.write_entries(&documents, &unreadable).await?;
        }
        info!(path = %self.path.display(), "{outcome}");
        Ok(outcome)
    }
}

/// Display-ready projection of a ranked document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheapestFlightRow {
    pub departure: String,
    pub from: String,
    pub to: String,
    pub direction: String,
    pub price: f64,
    pub currency: String,
}

impl CheapestFlightRow {
    pub fn from_document(document: &FlightDocument) -> Option<Self> {
        let departure = document.departure()?;
        Some(Self {
            departure: departure.format("%Y-%m-%d %H:%M:%S").to_string(),
            from: document.departure_airport.city.name.clone(),
            to: document.arrival_airport.city.name.clone(),
            direction: document.direction(),
            price: document.latest_price()?,
            currency: document.price.currency_code.clone(),
        })
    }
}

/// The `n` cheapest flights departing today (local calendar date) or later.
pub async fn top_cheapest(path: impl AsRef<Path>, n: usize) -> Vec<FlightDocument> {
    let documents = JsonFlightStore::new(path.as_ref()).load().await;
    rank_cheapest(documents, n, Local::now().date_naive())
}

/// Keep entries whose departure date is on or after `today`, order them by their most recent
/// price (stable for equal prices) and truncate to `n`.
pub fn rank_cheapest(
    documents: Vec<FlightDocument>,
    n: usize,
    today: NaiveDate,
) -> Vec<FlightDocument> {
    let mut upcoming: Vec<(f64, FlightDocument)> = documents
        .into_iter()
        .filter_map(|document| {
            let Some(departure) = document.departure() else {
                warn!(
                    departure_date = %document.departure_date,
                    flight_number = %document.flight_number,
                    "skipping flight with unparseable departure date"
                );
                return None;
            };
            if departure.date() < today {
                return None;
            }
            let Some(latest) = document.latest_price() else {
                warn!(
                    departure_date = %departure.format(DOCUMENT_DATETIME_FORMAT),
                    flight_number = %document.flight_number,
                    "skipping flight without price history"
                );
                return None;
            };
            Some((latest, document))
        })
        .collect();

    upcoming.sort_by(|a, b| a.0.total_cmp(&b.0));
    upcoming
        .into_iter()
        .take(n)
        .map(|(_, document)| document)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between consecutive requests to the fare API.
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: Duration::from_millis(250),
        }
    }
}

/// Spaces requests out so the scrape loop never hammers the upstream API.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transient failures with capped exponential backoff.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        route: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, route, url);
        async {
            let mut attempt = 0usize;
            loop {
                self.pacer.wait().await;
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            debug!(%status, bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(%status, attempt, ?delay, "retryable status, backing off");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(error = %err, attempt, ?delay, "request failed, backing off");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
