//! Relational reconciler: keeps the normalized fare tables in step with each observation.
//!
//! Every sub-operation commits on its own. A failure halfway through the create path can leave
//! city/airport/route rows without a flight; the next observation of that flight finds and
//! reuses them.

use std::fmt;

use chrono::NaiveDateTime;
use farewatch_core::FlightObservation;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("creating table {table}: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{0} row vanished after a unique violation")]
    MissingRow(&'static str),
}

/// Flight row as returned by the natural-key join. IATA codes are kept exactly as stored
/// (fixed-width, space padded).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFlight {
    pub id: i32,
    pub flight_number: String,
    pub departure_date: NaiveDateTime,
    pub arrival_date: NaiveDateTime,
    pub departure_iata: String,
    pub arrival_iata: String,
    pub ticket_price: f64,
}

impl StoredFlight {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flight_number: row.try_get("flight_number")?,
            departure_date: row.try_get("departure_date")?,
            arrival_date: row.try_get("arrival_date")?,
            departure_iata: row.try_get("departure_iata")?,
            arrival_iata: row.try_get("arrival_iata")?,
            ticket_price: row.try_get("ticket_price")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceHistoryRow {
    pub id: i32,
    pub flight_id: i32,
    pub price: f64,
    pub currency_code: String,
    pub price_added_date: i64,
}

impl PriceHistoryRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flight_id: row.try_get("fk_flight_id")?,
            price: row.try_get("price")?,
            currency_code: row.try_get("currency_code")?,
            price_added_date: row.try_get("price_added_date")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Create,
    Update {
        flight_id: i32,
        previous_price: Option<f64>,
    },
    NoOp {
        flight_id: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DbOutcome {
    Created {
        flight_id: i32,
    },
    Updated {
        flight_id: i32,
        previous_price: Option<f64>,
        new_price: f64,
    },
    Unchanged {
        flight_id: i32,
    },
}

impl fmt::Display for DbOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { flight_id } => write!(f, "flight {flight_id} created"),
            Self::Updated {
                flight_id,
                previous_price: Some(previous),
                new_price,
            } => write!(f, "flight {flight_id} price {previous} -> {new_price}"),
            Self::Updated {
                flight_id,
                previous_price: None,
                new_price,
            } => write!(f, "flight {flight_id} price {new_price} recorded"),
            Self::Unchanged { flight_id } => write!(f, "flight {flight_id} unchanged"),
        }
    }
}

/// Pure reconcile decision for one observation given what the natural-key lookup found.
pub fn decide(
    observation: &FlightObservation,
    existing: Option<&StoredFlight>,
    latest: Option<&PriceHistoryRow>,
) -> Decision {
    let Some(flight) = existing else {
        return Decision::Create;
    };
    if !same_flight(observation, flight) {
        warn!(
            flight_id = flight.id,
            key = %observation.natural_key(),
            "lookup returned a flight with different identity; leaving it untouched"
        );
        return Decision::NoOp {
            flight_id: flight.id,
        };
    }
    compare_price(flight.id, latest, observation.price())
}

/// Exact comparison against the most recent history row. A flight without history gets one.
pub fn compare_price(flight_id: i32, latest: Option<&PriceHistoryRow>, price: f64) -> Decision {
    match latest {
        Some(row) if row.price == price => Decision::NoOp { flight_id },
        Some(row) => Decision::Update {
            flight_id,
            previous_price: Some(row.price),
        },
        None => Decision::Update {
            flight_id,
            previous_price: None,
        },
    }
}

fn same_flight(observation: &FlightObservation, flight: &StoredFlight) -> bool {
    flight.departure_iata.trim() == observation.departure_airport().iata()
        && flight.arrival_iata.trim() == observation.arrival_airport().iata()
        && flight.flight_number.trim() == observation.flight_number()
        && flight.departure_date == observation.departure()
        && flight.arrival_date == observation.arrival()
}

/// Insert in a transaction of its own. A unique violation is reported as `Ok(None)` so the
/// caller can fall back to a lookup.
async fn insert_returning_id<'q>(
    pool: &PgPool,
    table: &'static str,
    query: QueryScalar<'q, Postgres, i32, PgArguments>,
) -> Result<Option<i32>, DbError> {
    let mut tx = pool.begin().await?;
    match query.fetch_one(&mut *tx).await {
        Ok(id) => {
            tx.commit().await?;
            debug!(table, id, "row inserted");
            Ok(Some(id))
        }
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            debug!(table, "row already exists");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub mod city {
    use farewatch_core::City;
    use sqlx::PgPool;

    use super::{insert_returning_id, DbError};

    pub async fn find(pool: &PgPool, city: &City) -> Result<Option<i32>, DbError> {
        let id = sqlx::query_scalar(
            "SELECT id FROM city WHERE name = $1 AND code = $2 AND country_code = $3 \
             ORDER BY id LIMIT 1",
        )
        .bind(city.name.as_str())
        .bind(city.code.as_str())
        .bind(city.country_code.as_str())
        .fetch_optional(pool)
        .await?;
        Ok(id)
    }

    pub async fn insert(pool: &PgPool, city: &City) -> Result<Option<i32>, DbError> {
        let query = sqlx::query_scalar(
            "INSERT INTO city (name, code, country_code) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(city.name.as_str())
        .bind(city.code.as_str())
        .bind(city.country_code.as_str());
        insert_returning_id(pool, "city", query).await
    }

    pub async fn obtain(pool: &PgPool, city: &City) -> Result<i32, DbError> {
        if let Some(id) = find(pool, city).await? {
            return Ok(id);
        }
        match insert(pool, city).await? {
            Some(id) => Ok(id),
            None => find(pool, city).await?.ok_or(DbError::MissingRow("city")),
        }
    }
}

pub mod airport {
    use farewatch_core::Airport;
    use sqlx::PgPool;

    use super::{insert_returning_id, DbError};

    /// Departure and arrival airports live in separate tables of identical shape.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Side {
        Departure,
        Arrival,
    }

    impl Side {
        pub fn table(self) -> &'static str {
            match self {
                Self::Departure => "departure_airport",
                Self::Arrival => "arrival_airport",
            }
        }

        fn select_sql(self) -> &'static str {
            match self {
                Self::Departure => {
                    "SELECT id FROM departure_airport WHERE TRIM(iata_code) = $1 ORDER BY id LIMIT 1"
                }
                Self::Arrival => {
                    "SELECT id FROM arrival_airport WHERE TRIM(iata_code) = $1 ORDER BY id LIMIT 1"
                }
            }
        }

        fn insert_sql(self) -> &'static str {
            match self {
                Self::Departure => {
                    "INSERT INTO departure_airport (country_name, iata_code, name, fk_city_id) \
                     VALUES ($1, $2, $3, $4) RETURNING id"
                }
                Self::Arrival => {
                    "INSERT INTO arrival_airport (country_name, iata_code, name, fk_city_id) \
                     VALUES ($1, $2, $3, $4) RETURNING id"
                }
            }
        }
    }

    pub async fn find(pool: &PgPool, side: Side, iata: &str) -> Result<Option<i32>, DbError> {
        let id = sqlx::query_scalar(side.select_sql())
            .bind(iata.trim())
            .fetch_optional(pool)
            .await?;
        Ok(id)
    }

    pub async fn insert(
        pool: &PgPool,
        side: Side,
        airport: &Airport,
        city_id: i32,
    ) -> Result<Option<i32>, DbError> {
        let query = sqlx::query_scalar(side.insert_sql())
            .bind(airport.country_name.as_str())
            .bind(airport.iata())
            .bind(airport.name.as_str())
            .bind(city_id);
        insert_returning_id(pool, side.table(), query).await
    }

    pub async fn obtain(
        pool: &PgPool,
        side: Side,
        airport: &Airport,
        city_id: i32,
    ) -> Result<i32, DbError> {
        if let Some(id) = find(pool, side, airport.iata()).await? {
            return Ok(id);
        }
        match insert(pool, side, airport, city_id).await? {
            Some(id) => Ok(id),
            None => find(pool, side, airport.iata())
                .await?
                .ok_or(DbError::MissingRow(side.table())),
        }
    }
}

pub mod route {
    use sqlx::PgPool;

    use super::{insert_returning_id, DbError};

    pub async fn find(
        pool: &PgPool,
        depart_airport_id: i32,
        arriv_airport_id: i32,
        flight_number: &str,
    ) -> Result<Option<i32>, DbError> {
        let id = sqlx::query_scalar(
            "SELECT id FROM route \
             WHERE fk_depart_airport_id = $1 AND fk_arriv_airport_id = $2 AND flight_number = $3 \
             ORDER BY id LIMIT 1",
        )
        .bind(depart_airport_id)
        .bind(arriv_airport_id)
        .bind(flight_number)
        .fetch_optional(pool)
        .await?;
        Ok(id)
    }

    pub async fn obtain(
        pool: &PgPool,
        depart_airport_id: i32,
        arriv_airport_id: i32,
        flight_number: &str,
    ) -> Result<i32, DbError> {
        if let Some(id) = find(pool, depart_airport_id, arriv_airport_id, flight_number).await? {
            return Ok(id);
        }
        let query = sqlx::query_scalar(
            "INSERT INTO route (fk_depart_airport_id, fk_arriv_airport_id, flight_number) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(depart_airport_id)
        .bind(arriv_airport_id)
        .bind(flight_number);
        match insert_returning_id(pool, "route", query).await? {
            Some(id) => Ok(id),
            None => find(pool, depart_airport_id, arriv_airport_id, flight_number)
                .await?
                .ok_or(DbError::MissingRow("route")),
        }
    }
}

pub mod price_history {
    use farewatch_core::FlightObservation;
    use sqlx::{PgConnection, PgPool};

    use super::{DbError, PriceHistoryRow};

    pub async fn latest(pool: &PgPool, flight_id: i32) -> Result<Option<PriceHistoryRow>, DbError> {
        let row = sqlx::query(
            "SELECT id, fk_flight_id, price, currency_code, price_added_date \
             FROM ticket_prices_history WHERE fk_flight_id = $1 \
             ORDER BY price_added_date DESC, id DESC LIMIT 1",
        )
        .bind(flight_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.as_ref().map(PriceHistoryRow::from_row).transpose()?)
    }

    /// Append-only; callers own the surrounding transaction.
    pub(super) async fn append(
        conn: &mut PgConnection,
        flight_id: i32,
        observation: &FlightObservation,
    ) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO ticket_prices_history (fk_flight_id, price, currency_code, price_added_date) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(flight_id)
        .bind(observation.price())
        .bind(observation.currency_code())
        .bind(observation.observed_at().timestamp())
        .fetch_one(conn)
        .await
    }
}

pub mod flight {
    use chrono::NaiveDateTime;
    use farewatch_core::FlightObservation;
    use sqlx::PgPool;

    use super::{is_unique_violation, price_history, DbError, StoredFlight};

    /// Foreign keys resolved by the create path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlightRefs {
        pub route_id: i32,
        pub depart_airport_id: i32,
        pub arriv_airport_id: i32,
    }

    /// Natural-key lookup joined through both airport tables.
    pub async fn find_matching(
        pool: &PgPool,
        observation: &FlightObservation,
    ) -> Result<Option<StoredFlight>, DbError> {
        let row = sqlx::query(
            "SELECT f.id, f.flight_number, f.departure_date, f.arrival_date, f.ticket_price, \
                    da.iata_code AS departure_iata, aa.iata_code AS arrival_iata \
             FROM flight f \
             JOIN departure_airport da ON da.id = f.fk_depart_airport_id \
             JOIN arrival_airport aa ON aa.id = f.fk_arriv_airport_id \
             WHERE f.flight_number = $1 AND f.departure_date = $2 AND f.arrival_date = $3 \
               AND TRIM(da.iata_code) = $4 AND TRIM(aa.iata_code) = $5 \
             ORDER BY f.id LIMIT 1",
        )
        .bind(observation.flight_number())
        .bind(observation.departure())
        .bind(observation.arrival())
        .bind(observation.departure_airport().iata())
        .bind(observation.arrival_airport().iata())
        .fetch_optional(pool)
        .await?;
        Ok(row.as_ref().map(StoredFlight::from_row).transpose()?)
    }

    /// Lookup by the unique constraint's columns; used after an insert hits that constraint.
    pub async fn find_by_natural_key(
        pool: &PgPool,
        depart_airport_id: i32,
        arriv_airport_id: i32,
        flight_number: &str,
        departure: NaiveDateTime,
    ) -> Result<Option<i32>, DbError> {
        let id = sqlx::query_scalar(
            "SELECT id FROM flight \
             WHERE fk_depart_airport_id = $1 AND fk_arriv_airport_id = $2 \
               AND flight_number = $3 AND departure_date = $4",
        )
        .bind(depart_airport_id)
        .bind(arriv_airport_id)
        .bind(flight_number)
        .bind(departure)
        .fetch_optional(pool)
        .await?;
        Ok(id)
    }

    /// Flight row and its first history row, committed together. `Ok(None)` when the flight
    /// already exists.
    pub async fn insert_with_first_price(
        pool: &PgPool,
        refs: FlightRefs,
        observation: &FlightObservation,
    ) -> Result<Option<i32>, DbError> {
        let mut tx = pool.begin().await?;
        let inserted = sqlx::query_scalar(
            "INSERT INTO flight (fk_route_id, fk_depart_airport_id, fk_arriv_airport_id, \
                                 departure_date, arrival_date, ticket_price, flight_number, \
                                 price_updated_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(refs.route_id)
        .bind(refs.depart_airport_id)
        .bind(refs.arriv_airport_id)
        .bind(observation.departure())
        .bind(observation.arrival())
        .bind(observation.price())
        .bind(observation.flight_number())
        .bind(observation.price_updated())
        .fetch_one(&mut *tx)
        .await;
        let flight_id: i32 = match inserted {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        price_history::append(&mut *tx, flight_id, observation).await?;
        tx.commit().await?;
        Ok(Some(flight_id))
    }

    /// New history row plus the flight's current price, committed together.
    pub async fn record_new_price(
        pool: &PgPool,
        flight_id: i32,
        observation: &FlightObservation,
    ) -> Result<(), DbError> {
        let mut tx = pool.begin().await?;
        price_history::append(&mut *tx, flight_id, observation).await?;
        sqlx::query("UPDATE flight SET ticket_price = $1, price_updated_date = $2 WHERE id = $3")
            .bind(observation.price())
            .bind(observation.price_updated())
            .bind(flight_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Reconcile one observation against the relational store.
pub async fn compare_and_insert(
    pool: &PgPool,
    observation: &FlightObservation,
) -> Result<DbOutcome, DbError> {
    let existing = flight::find_matching(pool, observation).await?;
    let latest = match &existing {
        Some(stored) => price_history::latest(pool, stored.id).await?,
        None => None,
    };
    let outcome = match decide(observation, existing.as_ref(), latest.as_ref()) {
        Decision::Create => create(pool, observation).await?,
        decision => apply(pool, decision, observation).await?,
    };
    info!(key = %observation.natural_key(), "{outcome}");
    Ok(outcome)
}

async fn create(pool: &PgPool, observation: &FlightObservation) -> Result<DbOutcome, DbError> {
    let departure = observation.departure_airport();
    let arrival = observation.arrival_airport();

    let departure_city = city::obtain(pool, &departure.city).await?;
    let arrival_city = city::obtain(pool, &arrival.city).await?;
    let depart_airport_id =
        airport::obtain(pool, airport::Side::Departure, departure, departure_city).await?;
    let arriv_airport_id =
        airport::obtain(pool, airport::Side::Arrival, arrival, arrival_city).await?;
    let route_id =
        route::obtain(pool, depart_airport_id, arriv_airport_id, observation.flight_number()).await?;
    let refs = flight::FlightRefs {
        route_id,
        depart_airport_id,
        arriv_airport_id,
    };

    if let Some(flight_id) = flight::insert_with_first_price(pool, refs, observation).await? {
        return Ok(DbOutcome::Created { flight_id });
    }

    // Same flight number and departure already stored (e.g. arrival time changed): treat it as
    // the matched flight and compare prices.
    let flight_id = flight::find_by_natural_key(
        pool,
        depart_airport_id,
        arriv_airport_id,
        observation.flight_number(),
        observation.departure(),
    )
    .await?
    .ok_or(DbError::MissingRow("flight"))?;
    let latest = price_history::latest(pool, flight_id).await?;
    let decision = compare_price(flight_id, latest.as_ref(), observation.price());
    apply(pool, decision, observation).await
}

async fn apply(
    pool: &PgPool,
    decision: Decision,
    observation: &FlightObservation,
) -> Result<DbOutcome, DbError> {
    match decision {
        Decision::Update {
            flight_id,
            previous_price,
        } => {
            flight::record_new_price(pool, flight_id, observation).await?;
            Ok(DbOutcome::Updated {
                flight_id,
                previous_price,
                new_price: observation.price(),
            })
        }
        Decision::NoOp { flight_id } => Ok(DbOutcome::Unchanged { flight_id }),
        Decision::Create => Err(DbError::MissingRow("flight")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use farewatch_core::{Airport, City};

    use crate::schema::{ensure_schema, TableStatus};
    use crate::test_db::TestDb;

    fn airport(iata: &str, city: &str, country: &str, country_code: &str) -> Airport {
        Airport {
            country_name: country.to_string(),
            iata_code: iata.to_string(),
            name: city.to_string(),
            city: City {
                name: city.to_string(),
                code: city.to_ascii_uppercase(),
                country_code: country_code.to_string(),
            },
        }
    }

    fn observation(price: f64, observed_secs: i64) -> FlightObservation {
        FlightObservation::builder()
            .departure_airport(airport("VNO", "Vilnius", "Lithuania", "lt"))
            .arrival_airport(airport("BCN", "Barcelona", "Spain", "es"))
            .departure("2025-07-14T06:45:00".parse().unwrap())
            .arrival("2025-07-14T09:20:00".parse().unwrap())
            .flight_number("FR2841")
            .price(price, "EUR")
            .observed_at(Utc.timestamp_opt(1_736_000_000 + observed_secs, 0).unwrap())
            .build()
            .expect("valid observation")
    }

    fn stored(obs: &FlightObservation) -> StoredFlight {
        StoredFlight {
            id: 7,
            flight_number: obs.flight_number().to_string(),
            departure_date: obs.departure(),
            arrival_date: obs.arrival(),
            departure_iata: format!("{:<5}", obs.departure_airport().iata()),
            arrival_iata: format!("{:<5}", obs.arrival_airport().iata()),
            ticket_price: 100.0,
        }
    }

    fn history(price: f64) -> PriceHistoryRow {
        PriceHistoryRow {
            id: 1,
            flight_id: 7,
            price,
            currency_code: "EUR".into(),
            price_added_date: 1_736_000_000,
        }
    }

    #[test]
    fn unknown_flight_is_created() {
        assert_eq!(decide(&observation(100.0, 0), None, None), Decision::Create);
    }

    #[test]
    fn same_price_is_noop_and_new_price_is_update() {
        let obs = observation(100.0, 0);
        let flight = stored(&obs);
        assert_eq!(
            decide(&obs, Some(&flight), Some(&history(100.0))),
            Decision::NoOp { flight_id: 7 }
        );

        let cheaper = observation(95.0, 60);
        assert_eq!(
            decide(&cheaper, Some(&flight), Some(&history(100.0))),
            Decision::Update {
                flight_id: 7,
                previous_price: Some(100.0)
            }
        );
    }

    #[test]
    fn padded_iata_codes_match_after_trim() {
        let obs = observation(100.0, 0);
        let flight = stored(&obs);
        assert_eq!(flight.departure_iata, "VNO  ");
        assert_eq!(
            decide(&obs, Some(&flight), Some(&history(100.0))),
            Decision::NoOp { flight_id: 7 }
        );
    }

    #[test]
    fn identity_mismatch_is_left_alone() {
        let obs = observation(80.0, 0);
        let mut flight = stored(&obs);
        flight.arrival_iata = "GRO  ".into();
        assert_eq!(
            decide(&obs, Some(&flight), Some(&history(100.0))),
            Decision::NoOp { flight_id: 7 }
        );
    }

    #[test]
    fn flight_without_history_gets_its_price_recorded() {
        let obs = observation(100.0, 0);
        assert_eq!(
            decide(&obs, Some(&stored(&obs)), None),
            Decision::Update {
                flight_id: 7,
                previous_price: None
            }
        );
    }

    #[test]
    fn outcome_messages() {
        assert_eq!(DbOutcome::Created { flight_id: 3 }.to_string(), "flight 3 created");
        assert_eq!(
            DbOutcome::Updated {
                flight_id: 3,
                previous_price: Some(100.0),
                new_price: 95.0
            }
            .to_string(),
            "flight 3 price 100 -> 95"
        );
        assert_eq!(DbOutcome::Unchanged { flight_id: 3 }.to_string(), "flight 3 unchanged");
    }

    async fn history_rows(pool: &PgPool, flight_id: i32) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM ticket_prices_history WHERE fk_flight_id = $1")
            .bind(flight_id)
            .fetch_one(pool)
            .await
            .expect("count history rows")
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let Some(db) = TestDb::with_tables().await else { return };
        let statuses = ensure_schema(&db.pool).await.expect("second ensure");
        assert_eq!(statuses.len(), 6);
        assert!(statuses
            .iter()
            .all(|(_, status)| *status == TableStatus::AlreadyExists));
        db.teardown().await;
    }

    #[tokio::test]
    async fn create_path_inserts_one_row_per_table() {
        let Some(db) = TestDb::with_tables().await else { return };
        let outcome = compare_and_insert(&db.pool, &observation(100.0, 0))
            .await
            .expect("reconcile");
        assert!(matches!(outcome, DbOutcome::Created { .. }));

        assert_eq!(db.count("city").await, 2);
        for table in [
            "departure_airport",
            "arrival_airport",
            "route",
            "flight",
            "ticket_prices_history",
        ] {
            assert_eq!(db.count(table).await, 1, "{table}");
        }
        db.teardown().await;
    }

    #[tokio::test]
    async fn repeated_price_is_noop_and_changed_price_appends() {
        let Some(db) = TestDb::with_tables().await else { return };
        let DbOutcome::Created { flight_id } =
            compare_and_insert(&db.pool, &observation(100.0, 0)).await.unwrap()
        else {
            panic!("expected create");
        };

        let again = compare_and_insert(&db.pool, &observation(100.0, 60)).await.unwrap();
        assert_eq!(again, DbOutcome::Unchanged { flight_id });
        assert_eq!(history_rows(&db.pool, flight_id).await, 1);

        let cheaper = compare_and_insert(&db.pool, &observation(95.0, 120)).await.unwrap();
        assert_eq!(
            cheaper,
            DbOutcome::Updated {
                flight_id,
                previous_price: Some(100.0),
                new_price: 95.0
            }
        );
        assert_eq!(history_rows(&db.pool, flight_id).await, 2);
        assert_eq!(db.count("flight").await, 1);

        let ticket_price: f64 = sqlx::query_scalar("SELECT ticket_price FROM flight WHERE id = $1")
            .bind(flight_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(ticket_price, 95.0);
        db.teardown().await;
    }

    #[tokio::test]
    async fn ticket_price_tracks_latest_history_row() {
        let Some(db) = TestDb::with_tables().await else { return };
        for (step, price) in [100.0, 95.0, 100.0, 100.0, 120.0].into_iter().enumerate() {
            compare_and_insert(&db.pool, &observation(price, step as i64 * 60))
                .await
                .unwrap();
        }
        let flight = flight::find_matching(&db.pool, &observation(0.0, 0))
            .await
            .unwrap()
            .expect("flight stored");
        let latest = price_history::latest(&db.pool, flight.id)
            .await
            .unwrap()
            .expect("history present");
        assert_eq!(flight.ticket_price, latest.price);
        assert_eq!(latest.price, 120.0);
        assert_eq!(history_rows(&db.pool, flight.id).await, 4);
        db.teardown().await;
    }

    #[tokio::test]
    async fn padded_stored_iata_matches_incoming_code() {
        let Some(db) = TestDb::with_tables().await else { return };
        compare_and_insert(&db.pool, &observation(100.0, 0)).await.unwrap();

        let stored: String = sqlx::query_scalar("SELECT iata_code FROM departure_airport")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(stored, "VNO  ");

        let found = flight::find_matching(&db.pool, &observation(100.0, 60))
            .await
            .unwrap()
            .expect("padded code matches");
        assert_eq!(found.departure_iata, "VNO  ");
        assert_eq!(
            compare_and_insert(&db.pool, &observation(100.0, 60)).await.unwrap(),
            DbOutcome::Unchanged { flight_id: found.id }
        );
        db.teardown().await;
    }

    #[tokio::test]
    async fn orphaned_rows_are_reused() {
        let Some(db) = TestDb::with_tables().await else { return };
        let obs = observation(100.0, 0);
        let city_id = city::obtain(&db.pool, &obs.departure_airport().city).await.unwrap();
        airport::obtain(&db.pool, airport::Side::Departure, obs.departure_airport(), city_id)
            .await
            .unwrap();

        compare_and_insert(&db.pool, &obs).await.unwrap();
        assert_eq!(db.count("city").await, 2);
        assert_eq!(db.count("departure_airport").await, 1);
        db.teardown().await;
    }

    #[tokio::test]
    async fn changed_arrival_time_falls_back_to_natural_key() {
        let Some(db) = TestDb::with_tables().await else { return };
        let DbOutcome::Created { flight_id } =
            compare_and_insert(&db.pool, &observation(100.0, 0)).await.unwrap()
        else {
            panic!("expected create");
        };

        let retimed = FlightObservation::builder()
            .departure_airport(airport("VNO", "Vilnius", "Lithuania", "lt"))
            .arrival_airport(airport("BCN", "Barcelona", "Spain", "es"))
            .departure("2025-07-14T06:45:00".parse().unwrap())
            .arrival("2025-07-14T09:35:00".parse().unwrap())
            .flight_number("FR2841")
            .price(90.0, "EUR")
            .observed_at(Utc.timestamp_opt(1_736_000_600, 0).unwrap())
            .build()
            .unwrap();
        let outcome = compare_and_insert(&db.pool, &retimed).await.unwrap();
        assert_eq!(
            outcome,
            DbOutcome::Updated {
                flight_id,
                previous_price: Some(100.0),
                new_price: 90.0
            }
        );
        assert_eq!(db.count("flight").await, 1);
        db.teardown().await;
    }
}
