//! Idempotent creation of the six fare tables.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::relational::DbError;

/// One table and the statements that create it (plus its indexes).
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    AlreadyExists,
}

/// Foreign-key order: every table only references tables listed before it.
pub const TABLES: [TableDef; 6] = [
    TableDef {
        name: "city",
        statements: &[r#"
            CREATE TABLE city (
                id SERIAL PRIMARY KEY,
                name VARCHAR(60) NOT NULL,
                code VARCHAR(60) NOT NULL,
                country_code VARCHAR(10) NOT NULL,
                UNIQUE (name, code, country_code)
            )"#],
    },
    TableDef {
        name: "departure_airport",
        statements: &[r#"
            CREATE TABLE departure_airport (
                id SERIAL PRIMARY KEY,
                country_name VARCHAR(60) NOT NULL,
                iata_code CHAR(5) NOT NULL UNIQUE,
                name VARCHAR(60) NOT NULL,
                fk_city_id INTEGER NOT NULL REFERENCES city (id)
            )"#],
    },
    TableDef {
        name: "arrival_airport",
        statements: &[r#"
            CREATE TABLE arrival_airport (
                id SERIAL PRIMARY KEY,
                country_name VARCHAR(60) NOT NULL,
                iata_code CHAR(5) NOT NULL UNIQUE,
                name VARCHAR(60) NOT NULL,
                fk_city_id INTEGER NOT NULL REFERENCES city (id)
            )"#],
    },
    TableDef {
        name: "route",
        statements: &[r#"
            CREATE TABLE route (
                id SERIAL PRIMARY KEY,
                fk_depart_airport_id INTEGER NOT NULL REFERENCES departure_airport (id),
                fk_arriv_airport_id INTEGER NOT NULL REFERENCES arrival_airport (id),
                flight_number VARCHAR(10) NOT NULL,
                UNIQUE (fk_depart_airport_id, fk_arriv_airport_id, flight_number)
            )"#],
    },
    TableDef {
        name: "flight",
        statements: &[r#"
            CREATE TABLE flight (
                id SERIAL PRIMARY KEY,
                fk_route_id INTEGER NOT NULL REFERENCES route (id),
                fk_depart_airport_id INTEGER NOT NULL REFERENCES departure_airport (id),
                fk_arriv_airport_id INTEGER NOT NULL REFERENCES arrival_airport (id),
                departure_date TIMESTAMP NOT NULL,
                arrival_date TIMESTAMP NOT NULL,
                ticket_price DOUBLE PRECISION NOT NULL,
                flight_number VARCHAR(10) NOT NULL,
                price_updated_date BIGINT NOT NULL,
                UNIQUE (fk_depart_airport_id, fk_arriv_airport_id, flight_number, departure_date)
            )"#],
    },
    TableDef {
        name: "ticket_prices_history",
        statements: &[
            r#"
            CREATE TABLE ticket_prices_history (
                id SERIAL PRIMARY KEY,
                fk_flight_id INTEGER NOT NULL REFERENCES flight (id),
                price DOUBLE PRECISION NOT NULL,
                currency_code CHAR(3) NOT NULL,
                price_added_date BIGINT NOT NULL
            )"#,
            "CREATE INDEX ticket_prices_history_flight_added_idx \
             ON ticket_prices_history (fk_flight_id, price_added_date)",
        ],
    },
];

pub async fn table_exists(pool: &PgPool, name: &str) -> Result<bool, DbError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = $1
        )",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Create `table` unless the catalog already lists it. Creation runs in one transaction; on
/// error the transaction is dropped (rolled back) and the table stays absent.
pub async fn ensure_table(pool: &PgPool, table: &TableDef) -> Result<TableStatus, DbError> {
    if table_exists(pool, table.name).await? {
        debug!(table = table.name, "table already exists");
        return Ok(TableStatus::AlreadyExists);
    }

    let schema_err = |source| DbError::Schema {
        table: table.name,
        source,
    };
    let mut tx = pool.begin().await.map_err(schema_err)?;
    for statement in table.statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(schema_err)?;
    }
    tx.commit().await.map_err(schema_err)?;
    info!(table = table.name, "table created");
    Ok(TableStatus::Created)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<Vec<(&'static str, TableStatus)>, DbError> {
    let mut statuses = Vec::with_capacity(TABLES.len());
    for table in &TABLES {
        statuses.push((table.name, ensure_table(pool, table).await?));
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_listed_in_foreign_key_order() {
        let names: Vec<_> = TABLES.iter().map(|t| t.name).collect();
        for (idx, table) in TABLES.iter().enumerate() {
            for statement in table.statements {
                for later in &names[idx + 1..] {
                    assert!(
                        !statement.contains(&format!("REFERENCES {later} ")),
                        "{} references {later}, which is created after it",
                        table.name
                    );
                }
            }
        }
        assert_eq!(names.first(), Some(&"city"));
        assert_eq!(names.last(), Some(&"ticket_prices_history"));
    }

    #[test]
    fn every_table_has_a_create_statement() {
        for table in &TABLES {
            assert!(table.statements[0].contains(&format!("CREATE TABLE {} (", table.name)));
        }
    }
}
