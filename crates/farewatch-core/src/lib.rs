//! Core flight observation model and price-history document types for farewatch.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "farewatch-core";

/// Timestamp layout used by the upstream API and the JSON document store.
pub const DOCUMENT_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct City {
    pub name: String,
    pub code: String,
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Airport {
    pub country_name: String,
    pub iata_code: String,
    pub name: String,
    pub city: City,
}

impl Airport {
    /// IATA code with fixed-width padding removed, as used for every comparison.
    pub fn iata(&self) -> &str {
        self.iata_code.trim()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObservationError {
    #[error("flight observation is missing `{0}`")]
    MissingField(&'static str),
    #[error("flight observation has an empty `{0}`")]
    EmptyField(&'static str),
    #[error("price must be a finite, non-negative number")]
    InvalidPrice,
}

/// The (departure IATA, arrival IATA, flight number, departure) tuple that identifies
/// one scheduled flight across repeated observations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub departure_iata: String,
    pub arrival_iata: String,
    pub flight_number: String,
    pub departure: NaiveDateTime,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {} {}",
            self.departure_iata,
            self.arrival_iata,
            self.flight_number,
            self.departure.format(DOCUMENT_DATETIME_FORMAT)
        )
    }
}

/// One validated upstream fare quote. Built once through [`FlightObservationBuilder`] and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightObservation {
    departure_airport: Airport,
    arrival_airport: Airport,
    departure: NaiveDateTime,
    arrival: NaiveDateTime,
    flight_number: String,
    price: f64,
    currency_code: String,
    observed_at: DateTime<Utc>,
    price_updated: i64,
}

impl FlightObservation {
    pub fn builder() -> FlightObservationBuilder {
        FlightObservationBuilder::default()
    }

    pub fn departure_airport(&self) -> &Airport {
        &self.departure_airport
    }

    pub fn arrival_airport(&self) -> &Airport {
        &self.arrival_airport
    }

    pub fn departure(&self) -> NaiveDateTime {
        self.departure
    }

    pub fn arrival(&self) -> NaiveDateTime {
        self.arrival
    }

    pub fn flight_number(&self) -> &str {
        &self.flight_number
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn currency_code(&self) -> &str {
        &self.currency_code
    }

    /// When the price was read from the upstream API.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Upstream "price updated" marker in epoch milliseconds.
    pub fn price_updated(&self) -> i64 {
        self.price_updated
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            departure_iata: self.departure_airport.iata_code.clone(),
            arrival_iata: self.arrival_airport.iata_code.clone(),
            flight_number: self.flight_number.clone(),
            departure: self.departure,
        }
    }

    /// `City (IATA) -> City (IATA)`
    pub fn direction(&self) -> String {
        format_direction(&self.departure_airport, &self.arrival_airport)
    }
}

impl fmt::Display for FlightObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} {} {}",
            self.flight_number,
            self.direction(),
            self.departure.format(DOCUMENT_DATETIME_FORMAT),
            self.arrival.format(DOCUMENT_DATETIME_FORMAT),
            self.price,
            self.currency_code
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlightObservationBuilder {
    departure_airport: Option<Airport>,
    arrival_airport: Option<Airport>,
    departure: Option<NaiveDateTime>,
    arrival: Option<NaiveDateTime>,
    flight_number: Option<String>,
    price: Option<f64>,
    currency_code: Option<String>,
    observed_at: Option<DateTime<Utc>>,
    price_updated: Option<i64>,
}

impl FlightObservationBuilder {
    pub fn departure_airport(mut self, airport: Airport) -> Self {
        self.departure_airport = Some(airport);
        self
    }

    pub fn arrival_airport(mut self, airport: Airport) -> Self {
        self.arrival_airport = Some(airport);
        self
    }

    pub fn departure(mut self, departure: NaiveDateTime) -> Self {
        self.departure = Some(departure);
        self
    }

    pub fn arrival(mut self, arrival: NaiveDateTime) -> Self {
        self.arrival = Some(arrival);
        self
    }

    pub fn flight_number(mut self, flight_number: impl Into<String>) -> Self {
        self.flight_number = Some(flight_number.into());
        self
    }

    pub fn price(mut self, value: f64, currency_code: impl Into<String>) -> Self {
        self.price = Some(value);
        self.currency_code = Some(currency_code.into());
        self
    }

    pub fn observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = Some(observed_at);
        self
    }

    pub fn price_updated(mut self, price_updated_ms: i64) -> Self {
        self.price_updated = Some(price_updated_ms);
        self
    }

    pub fn build(self) -> Result<FlightObservation, ObservationError> {
        let departure_airport = normalize_airport(
            self.departure_airport,
            "departureAirport",
            "departureAirport.iataCode",
        )?;
        let arrival_airport = normalize_airport(
            self.arrival_airport,
            "arrivalAirport",
            "arrivalAirport.iataCode",
        )?;
        let departure = self
            .departure
            .ok_or(ObservationError::MissingField("departureDate"))?;
        let arrival = self
            .arrival
            .ok_or(ObservationError::MissingField("arrivalDate"))?;
        let flight_number = required_text(self.flight_number, "flightNumber")?;
        let price = self.price.ok_or(ObservationError::MissingField("price.value"))?;
        if !price.is_finite() || price < 0.0 {
            return Err(ObservationError::InvalidPrice);
        }
        let currency_code = required_text(self.currency_code, "price.currencyCode")?;
        let observed_at = self.observed_at.unwrap_or_else(Utc::now);
        let price_updated = self
            .price_updated
            .unwrap_or_else(|| observed_at.timestamp_millis());

        Ok(FlightObservation {
            departure_airport,
            arrival_airport,
            departure,
            arrival,
            flight_number,
            price,
            currency_code,
            observed_at,
            price_updated,
        })
    }
}

fn required_text(value: Option<String>, name: &'static str) -> Result<String, ObservationError> {
    let value = value.ok_or(ObservationError::MissingField(name))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ObservationError::EmptyField(name));
    }
    Ok(trimmed.to_string())
}

fn normalize_airport(
    airport: Option<Airport>,
    field: &'static str,
    iata_field: &'static str,
) -> Result<Airport, ObservationError> {
    let mut airport = airport.ok_or(ObservationError::MissingField(field))?;
    let iata = airport.iata_code.trim().to_ascii_uppercase();
    if iata.is_empty() {
        return Err(ObservationError::EmptyField(iata_field));
    }
    airport.iata_code = iata;
    Ok(airport)
}

pub fn format_direction(departure: &Airport, arrival: &Airport) -> String {
    format!(
        "{} ({}) -> {} ({})",
        departure.city.name,
        departure.iata(),
        arrival.city.name,
        arrival.iata()
    )
}

/// Parses document/upstream timestamps (`2025-07-14T16:20:00`, fractional seconds and a space
/// separator are tolerated).
pub fn parse_document_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    value
        .parse::<NaiveDateTime>()
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistory {
    #[serde(default)]
    pub values: Vec<PricePoint>,
    #[serde(default)]
    pub currency_code: String,
}

/// One entry of the JSON document collection: a distinct natural identity plus its
/// append-only price history (oldest first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightDocument {
    pub departure_airport: Airport,
    pub arrival_airport: Airport,
    pub departure_date: String,
    pub arrival_date: String,
    pub price: PriceHistory,
    pub flight_number: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub price_updated: Vec<i64>,
}

impl FlightDocument {
    /// New entry with a single-element price history stamped with `observed_at`.
    pub fn from_observation(observation: &FlightObservation) -> Self {
        Self {
            departure_airport: observation.departure_airport.clone(),
            arrival_airport: observation.arrival_airport.clone(),
            departure_date: observation
                .departure
                .format(DOCUMENT_DATETIME_FORMAT)
                .to_string(),
            arrival_date: observation
                .arrival
                .format(DOCUMENT_DATETIME_FORMAT)
                .to_string(),
            price: PriceHistory {
                values: vec![PricePoint {
                    timestamp: observation.observed_at.timestamp(),
                    value: observation.price,
                }],
                currency_code: observation.currency_code.clone(),
            },
            flight_number: observation.flight_number.clone(),
            price_updated: vec![observation.price_updated],
        }
    }

    pub fn departure(&self) -> Option<NaiveDateTime> {
        parse_document_datetime(&self.departure_date)
    }

    /// Same (departure IATA, arrival IATA, departure timestamp) as `observation`.
    pub fn matches(&self, observation: &FlightObservation) -> bool {
        if !self
            .departure_airport
            .iata()
            .eq_ignore_ascii_case(observation.departure_airport.iata())
            || !self
                .arrival_airport
                .iata()
                .eq_ignore_ascii_case(observation.arrival_airport.iata())
        {
            return false;
        }
        match self.departure() {
            Some(departure) => departure == observation.departure,
            None => {
                self.departure_date.trim()
                    == observation
                        .departure
                        .format(DOCUMENT_DATETIME_FORMAT)
                        .to_string()
            }
        }
    }

    pub fn has_price(&self, value: f64) -> bool {
        self.price.values.iter().any(|point| point.value == value)
    }

    /// Most recently appended price, not the historical minimum.
    pub fn latest_price(&self) -> Option<f64> {
        self.price.values.last().map(|point| point.value)
    }

    pub fn push_price(&mut self, point: PricePoint, price_updated: i64) {
        self.price.values.push(point);
        self.price_updated.push(price_updated);
    }

    pub fn direction(&self) -> String {
        format_direction(&self.departure_airport, &self.arrival_airport)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(i64),
        Many(Vec<i64>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
        None => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn airport(iata: &str, city: &str) -> Airport {
        Airport {
            country_name: "Lithuania".into(),
            iata_code: iata.into(),
            name: city.into(),
            city: City {
                name: city.into(),
                code: city.to_ascii_uppercase(),
                country_code: "lt".into(),
            },
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn observation() -> FlightObservation {
        FlightObservation::builder()
            .departure_airport(airport(" vno ", "Vilnius"))
            .arrival_airport(airport("BCN", "Barcelona"))
            .departure(at(16, 20))
            .arrival(at(19, 20))
            .flight_number(" FR6429 ")
            .price(70.99, "EUR")
            .observed_at(Utc.with_ymd_and_hms(2025, 1, 15, 20, 0, 0).unwrap())
            .price_updated(1_736_962_797_000)
            .build()
            .expect("valid observation")
    }

    #[test]
    fn builder_normalizes_iata_and_flight_number() {
        let obs = observation();
        assert_eq!(obs.departure_airport().iata_code, "VNO");
        assert_eq!(obs.flight_number(), "FR6429");
        assert_eq!(obs.direction(), "Vilnius (VNO) -> Barcelona (BCN)");
        assert_eq!(
            obs.natural_key().to_string(),
            "VNO-BCN FR6429 2025-07-14T16:20:00"
        );
    }

    #[test]
    fn builder_rejects_missing_and_empty_fields() {
        let missing = FlightObservation::builder()
            .departure_airport(airport("VNO", "Vilnius"))
            .arrival_airport(airport("BCN", "Barcelona"))
            .departure(at(16, 20))
            .arrival(at(19, 20))
            .price(10.0, "EUR")
            .build();
        assert_eq!(
            missing.unwrap_err(),
            ObservationError::MissingField("flightNumber")
        );

        let empty_iata = FlightObservation::builder()
            .departure_airport(airport("   ", "Vilnius"))
            .arrival_airport(airport("BCN", "Barcelona"))
            .departure(at(16, 20))
            .arrival(at(19, 20))
            .flight_number("FR1")
            .price(10.0, "EUR")
            .build();
        assert_eq!(
            empty_iata.unwrap_err(),
            ObservationError::EmptyField("departureAirport.iataCode")
        );

        let bad_price = FlightObservation::builder()
            .departure_airport(airport("VNO", "Vilnius"))
            .arrival_airport(airport("BCN", "Barcelona"))
            .departure(at(16, 20))
            .arrival(at(19, 20))
            .flight_number("FR1")
            .price(f64::NAN, "EUR")
            .build();
        assert_eq!(bad_price.unwrap_err(), ObservationError::InvalidPrice);
    }

    #[test]
    fn price_updated_defaults_to_observation_time() {
        let observed_at = Utc.with_ymd_and_hms(2025, 1, 15, 20, 0, 0).unwrap();
        let obs = FlightObservation::builder()
            .departure_airport(airport("VNO", "Vilnius"))
            .arrival_airport(airport("BCN", "Barcelona"))
            .departure(at(16, 20))
            .arrival(at(19, 20))
            .flight_number("FR1")
            .price(10.0, "EUR")
            .observed_at(observed_at)
            .build()
            .unwrap();
        assert_eq!(obs.price_updated(), observed_at.timestamp_millis());
    }

    #[test]
    fn document_from_observation_has_single_price_point() {
        let obs = observation();
        let doc = FlightDocument::from_observation(&obs);
        assert_eq!(doc.departure_date, "2025-07-14T16:20:00");
        assert_eq!(doc.price.values.len(), 1);
        assert_eq!(doc.price.values[0].timestamp, obs.observed_at().timestamp());
        assert_eq!(doc.latest_price(), Some(70.99));
        assert_eq!(doc.price_updated, vec![1_736_962_797_000]);
        assert!(doc.matches(&obs));
    }

    #[test]
    fn document_matching_ignores_iata_padding() {
        let obs = observation();
        let mut doc = FlightDocument::from_observation(&obs);
        doc.departure_airport.iata_code = "VNO  ".into();
        assert!(doc.matches(&obs));

        doc.departure_date = "2025-07-15T16:20:00".into();
        assert!(!doc.matches(&obs));
    }

    #[test]
    fn document_serializes_with_camel_case_keys() {
        let doc = FlightDocument::from_observation(&observation());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["departureAirport"]["city"]["countryCode"], "lt");
        assert_eq!(json["price"]["currencyCode"], "EUR");
        assert_eq!(json["priceUpdated"][0], 1_736_962_797_000_i64);
    }

    #[test]
    fn price_updated_accepts_scalar_or_list() {
        let doc = FlightDocument::from_observation(&observation());
        let mut json = serde_json::to_value(&doc).unwrap();

        json["priceUpdated"] = serde_json::json!(1736962797000_i64);
        let scalar: FlightDocument = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(scalar.price_updated, vec![1_736_962_797_000]);

        json.as_object_mut().unwrap().remove("priceUpdated");
        let absent: FlightDocument = serde_json::from_value(json).unwrap();
        assert!(absent.price_updated.is_empty());
    }

    #[test]
    fn latest_price_is_last_appended_not_minimum() {
        let obs = observation();
        let mut doc = FlightDocument::from_observation(&obs);
        doc.push_price(
            PricePoint {
                timestamp: 1,
                value: 90.0,
            },
            2,
        );
        assert_eq!(doc.latest_price(), Some(90.0));
        assert!(doc.has_price(70.99));
        assert_eq!(doc.price_updated.len(), 2);
    }

    #[test]
    fn parses_space_separated_timestamps() {
        assert_eq!(parse_document_datetime("2025-07-14 16:20:00"), Some(at(16, 20)));
        assert_eq!(parse_document_datetime("not a date"), None);
    }
}
