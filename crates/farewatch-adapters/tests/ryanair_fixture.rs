use std::path::PathBuf;

use chrono::NaiveDate;
use farewatch_adapters::{FareSource, FetchContext, FixtureFareSource, RouteTarget};
use uuid::Uuid;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ryanair")
}

fn ctx() -> FetchContext {
    FetchContext {
        run_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn captured_payload_parses_into_observation() {
    let source = FixtureFareSource::new(fixtures_dir());
    let route = RouteTarget::new("VNO", "BCN");
    let date = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();

    let obs = source
        .fetch_one_way(&ctx(), &route, date)
        .await
        .expect("fixture should parse")
        .expect("fixture has a fare");

    assert_eq!(obs.flight_number(), "FR2841");
    assert_eq!(obs.price(), 70.99);
    assert_eq!(obs.currency_code(), "EUR");
    assert_eq!(obs.departure_airport().iata_code, "VNO");
    assert_eq!(obs.departure_airport().city.name, "Vilnius");
    assert_eq!(obs.arrival_airport().iata_code, "BCN");
    assert_eq!(obs.arrival_airport().country_name, "Spain");
    assert_eq!(obs.departure().date(), date);
    assert_eq!(obs.price_updated(), 1_736_962_797_000);
}

#[tokio::test]
async fn empty_fares_payload_is_no_fare() {
    let source = FixtureFareSource::new(fixtures_dir());
    let route = RouteTarget::new("VNO", "BCN");
    let date = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();

    let found = source.fetch_one_way(&ctx(), &route, date).await.unwrap();
    assert!(found.is_none());
}
