//! Scrape pipeline orchestration: routes × dates → JSON store → relational store.

pub mod relational;
pub mod schema;
#[cfg(test)]
mod test_db;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use farewatch_adapters::{
    AdapterError, FareSource, FetchContext, FixtureFareSource, RouteTarget, RyanairFareSource,
    DEFAULT_BASE_URL,
};
use farewatch_core::FlightObservation;
use farewatch_storage::{HttpClientConfig, HttpFetcher, JsonFlightStore, ReconcileOutcome};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::relational::DbOutcome;

pub const CRATE_NAME: &str = "farewatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRegistry {
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub departure: String,
    pub arrival: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl RouteRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Routes switched off in the registry, in file order.
    pub fn disabled(&self) -> impl Iterator<Item = &RouteConfig> {
        self.routes.iter().filter(|route| !route.enabled)
    }

    /// Enabled routes in file order.
    pub fn enabled_targets(&self) -> Vec<RouteTarget> {
        self.routes
            .iter()
            .filter(|route| route.enabled)
            .map(|route| RouteTarget::new(&route.departure, &route.arrival))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub base_url: String,
    pub data_path: PathBuf,
    pub routes_path: PathBuf,
    pub horizon_days: u32,
    pub schedule_crons: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fixtures_dir: Option<PathBuf>,
    pub start_date: Option<NaiveDate>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            data_path: PathBuf::from("./data/flights.json"),
            routes_path: PathBuf::from("./routes.yaml"),
            horizon_days: 60,
            schedule_crons: vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()],
            user_agent: "farewatch/0.1".to_string(),
            http_timeout_secs: 20,
            fixtures_dir: None,
            start_date: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            base_url: std::env::var("FAREWATCH_BASE_URL").unwrap_or(defaults.base_url),
            data_path: std::env::var("FAREWATCH_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
            routes_path: std::env::var("FAREWATCH_ROUTES")
                .map(PathBuf::from)
                .unwrap_or(defaults.routes_path),
            horizon_days: std::env::var("FAREWATCH_HORIZON_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.horizon_days),
            schedule_crons: std::env::var("FAREWATCH_SCHEDULE_CRON")
                .map(|v| parse_cron_list(&v))
                .unwrap_or(defaults.schedule_crons),
            user_agent: std::env::var("FAREWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("FAREWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            fixtures_dir: std::env::var("FAREWATCH_FIXTURES_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            start_date: std::env::var("FAREWATCH_START_DATE")
                .ok()
                .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok()),
        }
    }
}

fn parse_cron_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|expr| !expr.is_empty())
        .map(str::to_string)
        .collect()
}

/// Every date in `[start, start + horizon_days]`, ascending.
pub fn scan_dates(start: NaiveDate, horizon_days: u32) -> Vec<NaiveDate> {
    start.iter_days().take(horizon_days as usize + 1).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub routes: usize,
    pub dates_scanned: usize,
    pub observations: usize,
    pub json_created: usize,
    pub json_appended: usize,
    pub json_unchanged: usize,
    pub db_created: usize,
    pub db_updated: usize,
    pub db_unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct RunTally {
    dates_scanned: usize,
    observations: usize,
    json_created: usize,
    json_appended: usize,
    json_unchanged: usize,
    db_created: usize,
    db_updated: usize,
    db_unchanged: usize,
    skipped: usize,
    failed: usize,
}

impl RunTally {
    fn record_json(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created { .. } => self.json_created += 1,
            ReconcileOutcome::PriceAppended { .. } => self.json_appended += 1,
            ReconcileOutcome::Unchanged { .. } => self.json_unchanged += 1,
        }
    }

    fn record_db(&mut self, outcome: &DbOutcome) {
        match outcome {
            DbOutcome::Created { .. } => self.db_created += 1,
            DbOutcome::Updated { .. } => self.db_updated += 1,
            DbOutcome::Unchanged { .. } => self.db_unchanged += 1,
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: JsonFlightStore,
    source: Box<dyn FareSource>,
    db: Option<PgPool>,
}

impl SyncPipeline {
    /// Fixture payloads when `fixtures_dir` is set, the live fare API otherwise. No database
    /// until [`SyncPipeline::with_pool`].
    pub fn new(config: SyncConfig) -> Result<Self> {
        let source: Box<dyn FareSource> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixtureFareSource::new(dir.clone())),
            None => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Box::new(RyanairFareSource::new(config.base_url.clone(), http))
            }
        };
        Ok(Self {
            store: JsonFlightStore::new(config.data_path.clone()),
            config,
            source,
            db: None,
        })
    }

    pub fn with_source(mut self, source: Box<dyn FareSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.db = Some(pool);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = RouteRegistry::load(&self.config.routes_path).await?;
        let routes = registry.enabled_targets();
        let start = self
            .config
            .start_date
            .unwrap_or_else(|| Local::now().date_naive());
        let dates = scan_dates(start, self.config.horizon_days);
        let ctx = FetchContext { run_id };
        let mut tally = RunTally::default();

        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        async {
            info!(
                routes = routes.len(),
                %start,
                horizon_days = self.config.horizon_days,
                "sync run started"
            );
            for route in registry.disabled() {
                debug!(
                    route = %format!("{}-{}", route.departure, route.arrival),
                    notes = route.notes.as_deref().unwrap_or(""),
                    "route disabled"
                );
            }
            if self.db.is_none() {
                info!("no database configured; reconciling JSON store only");
            }
            for route in &routes {
                for date in &dates {
                    let scan = info_span!("scan", route = %route.label(), %date);
                    self.process_date(&ctx, route, *date, &mut tally)
                        .instrument(scan)
                        .await;
                }
            }
        }
        .instrument(span)
        .await;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            routes: routes.len(),
            dates_scanned: tally.dates_scanned,
            observations: tally.observations,
            json_created: tally.json_created,
            json_appended: tally.json_appended,
            json_unchanged: tally.json_unchanged,
            db_created: tally.db_created,
            db_updated: tally.db_updated,
            db_unchanged: tally.db_unchanged,
            skipped: tally.skipped,
            failed: tally.failed,
        };
        info!(
            %run_id,
            observations = summary.observations,
            skipped = summary.skipped,
            failed = summary.failed,
            "sync run finished"
        );
        Ok(summary)
    }

    /// One route/date: nothing here aborts the run.
    async fn process_date(
        &self,
        ctx: &FetchContext,
        route: &RouteTarget,
        date: NaiveDate,
        tally: &mut RunTally,
    ) {
        tally.dates_scanned += 1;
        let observation = match self.source.fetch_one_way(ctx, route, date).await {
            Ok(Some(observation)) => observation,
            Ok(None) => {
                debug!("no fare for date");
                tally.skipped += 1;
                return;
            }
            Err(err) => {
                log_fetch_failure(&err);
                tally.failed += 1;
                return;
            }
        };
        tally.observations += 1;

        match self.store.reconcile(&observation).await {
            Ok(outcome) => tally.record_json(&outcome),
            Err(err) => {
                error!(error = %err, "json store reconcile failed");
                tally.failed += 1;
            }
        }

        if let Some(pool) = &self.db {
            self.reconcile_db(pool, &observation, tally).await;
        }
    }

    async fn reconcile_db(&self, pool: &PgPool, observation: &FlightObservation, tally: &mut RunTally) {
        match relational::compare_and_insert(pool, observation).await {
            Ok(outcome) => tally.record_db(&outcome),
            Err(err) => {
                error!(key = %observation.natural_key(), error = %err, "relational reconcile failed");
                tally.failed += 1;
            }
        }
    }

    /// One job per configured cron expression, each running a full sync. `None` when no cron
    /// expression is configured.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if self.config.schedule_crons.is_empty() {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.schedule_crons {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            observations = summary.observations,
                            failed = summary.failed,
                            "scheduled sync complete"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%cron, "sync scheduled");
        }
        Ok(Some(sched))
    }
}

fn log_fetch_failure(err: &AdapterError) {
    if err.is_transient() {
        warn!(error = %err, "fare fetch failed; skipping date");
    } else {
        warn!(error = %err, "unusable fare payload; skipping date");
    }
}

/// `None` when no database URL is configured.
pub async fn connect_db(config: &SyncConfig) -> Result<Option<PgPool>> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Some(pool))
}

/// Connect, make sure every table exists, and hand back the pool.
pub async fn migrate(config: &SyncConfig) -> Result<Option<PgPool>> {
    let Some(pool) = connect_db(config).await? else {
        return Ok(None);
    };
    for (table, status) in schema::ensure_schema(&pool)
        .await
        .context("ensuring relational schema")?
    {
        debug!(table, ?status, "schema check");
    }
    Ok(Some(pool))
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let pool = migrate(&config).await?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(match pool {
        Some(pool) => pipeline.with_pool(pool),
        None => pipeline,
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    pipeline_from_env().await?.run_once().await
}
