//! Fare source contracts + the one-way fares API adapter.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use farewatch_core::{parse_document_datetime, Airport, FlightObservation, ObservationError};
use farewatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "farewatch-adapters";

pub const DEFAULT_BASE_URL: &str = "https://services-api.ryanair.com/farfnd/v4/oneWayFares";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// One directed airport pair to scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub departure: String,
    pub arrival: String,
}

impl RouteTarget {
    pub fn new(departure: impl Into<String>, arrival: impl Into<String>) -> Self {
        Self {
            departure: departure.into().trim().to_ascii_uppercase(),
            arrival: arrival.into().trim().to_ascii_uppercase(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.departure, self.arrival)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed fare payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    InvalidObservation(#[from] ObservationError),
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

impl AdapterError {
    /// Network/HTTP failures, as opposed to payloads that could not be understood.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_))
    }
}

#[async_trait]
pub trait FareSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Cheapest one-way fare for `route` departing on `date`. `Ok(None)` means the API had no
    /// fare for that day.
    async fn fetch_one_way(
        &self,
        ctx: &FetchContext,
        route: &RouteTarget,
        date: NaiveDate,
    ) -> Result<Option<FlightObservation>, AdapterError>;
}

pub fn one_way_fares_url(
    base_url: &str,
    departure_iata: &str,
    arrival_iata: &str,
    date: NaiveDate,
) -> String {
    let date = date.format("%Y-%m-%d");
    format!(
        "{}?departureAirportIataCode={}&arrivalAirportIataCode={}&outboundDepartureDateFrom={date}&outboundDepartureDateTo={date}",
        base_url.trim_end_matches('?'),
        departure_iata.trim().to_ascii_uppercase(),
        arrival_iata.trim().to_ascii_uppercase(),
    )
}

#[derive(Debug, Deserialize)]
struct OneWayFaresResponse {
    #[serde(default)]
    fares: Option<Vec<UpstreamFare>>,
}

#[derive(Debug, Deserialize)]
struct UpstreamFare {
    outbound: UpstreamOutbound,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamOutbound {
    departure_airport: Airport,
    arrival_airport: Airport,
    departure_date: String,
    arrival_date: String,
    flight_number: String,
    price: UpstreamPrice,
    #[serde(default)]
    price_updated: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamPrice {
    value: f64,
    currency_code: String,
}

/// Parse a one-way fares response. Only the first (cheapest) fare is used; an empty or absent
/// `fares` list is "no fare".
pub fn parse_one_way_fares(
    body: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<Option<FlightObservation>, AdapterError> {
    let response: OneWayFaresResponse = serde_json::from_slice(body)
        .map_err(|err| AdapterError::MalformedPayload(err.to_string()))?;
    let Some(fare) = response.fares.and_then(|fares| fares.into_iter().next()) else {
        return Ok(None);
    };
    let outbound = fare.outbound;

    let departure = parse_document_datetime(&outbound.departure_date).ok_or_else(|| {
        AdapterError::MalformedPayload(format!(
            "unparseable departureDate `{}`",
            outbound.departure_date
        ))
    })?;
    let arrival = parse_document_datetime(&outbound.arrival_date).ok_or_else(|| {
        AdapterError::MalformedPayload(format!(
            "unparseable arrivalDate `{}`",
            outbound.arrival_date
        ))
    })?;

    let mut builder = FlightObservation::builder()
        .departure_airport(outbound.departure_airport)
        .arrival_airport(outbound.arrival_airport)
        .departure(departure)
        .arrival(arrival)
        .flight_number(outbound.flight_number)
        .price(outbound.price.value, outbound.price.currency_code)
        .observed_at(observed_at);
    if let Some(price_updated) = outbound.price_updated {
        builder = builder.price_updated(price_updated);
    }
    Ok(Some(builder.build()?))
}

/// Live adapter for the one-way fares endpoint.
#[derive(Debug)]
pub struct RyanairFareSource {
    base_url: String,
    http: HttpFetcher,
}

impl RyanairFareSource {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl FareSource for RyanairFareSource {
    fn source_id(&self) -> &'static str {
        "ryanair"
    }

    async fn fetch_one_way(
        &self,
        ctx: &FetchContext,
        route: &RouteTarget,
        date: NaiveDate,
    ) -> Result<Option<FlightObservation>, AdapterError> {
        let url = one_way_fares_url(&self.base_url, &route.departure, &route.arrival, date);
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &route.label(), &url)
            .await?;
        parse_one_way_fares(&response.body, Utc::now())
    }
}

/// Offline adapter reading captured payloads named `DEP-ARR-YYYY-MM-DD.json` from a directory.
/// A missing file is "no fare".
#[derive(Debug, Clone)]
pub struct FixtureFareSource {
    dir: PathBuf,
}

impl FixtureFareSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn payload_path(&self, route: &RouteTarget, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", route.label(), date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl FareSource for FixtureFareSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_one_way(
        &self,
        _ctx: &FetchContext,
        route: &RouteTarget,
        date: NaiveDate,
    ) -> Result<Option<FlightObservation>, AdapterError> {
        let path = self.payload_path(route, date);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no fixture payload");
                return Ok(None);
            }
            Err(err) => {
                return Err(AdapterError::Fixture(
                    anyhow::Error::new(err)
                        .context(format!("reading fixture payload {}", path.display())),
                ))
            }
        };
        parse_one_way_fares(&body, Utc::now()).inspect_err(|err| {
            debug!(path = %path.display(), error = %err, "fixture payload rejected");
        })
    }
}
