//! Enrichment run orchestration: config, source registry, resolvers,
//! pipeline, reports and scheduling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rally_core::RecordKind;
use rally_ingest::{shape_counts, BundleRowSource, RowSource};
use rally_storage::{HttpClientConfig, HttpFetcher, JsonLinesBackend, ResolverCache};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub mod cityinfo;
pub mod dedup;
pub mod geocode;
pub mod pipeline;
pub mod regions;
pub mod sanitize;
pub mod store;

pub use cityinfo::{CityInfoError, CityInfoResolver, Encyclopedia, WikipediaClient};
pub use dedup::{EntityKind, Identity, IdentityDeduplicator, IdentityKey, SeenSet};
pub use geocode::{
    AddressError, AddressResolver, GeocodeCandidate, GeocodeQuery, GeocodeStrategy, Geocoder,
    NominatimGeocoder, CANONICAL_CASCADE,
};
pub use pipeline::{EnrichmentPipeline, IssueLog, RowOutcome, RowStage, RunStats, RunSummary};
pub use regions::{
    load_precinct_index, GeometryError, RegionSpatialIndex, RegionStore, SqliteRegionStore,
};
pub use sanitize::{sanitize, Sanitized};
pub use store::{DestinationStore, StoredRecord};

pub const CRATE_NAME: &str = "rally-sync";

pub const ADDRESS_CACHE_FILE: &str = "address_cache.jsonl";
pub const CITY_CACHE_FILE: &str = "city_cache.jsonl";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub sheet_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub kind: Option<RecordKind>,
    /// Row bundle, relative to the workspace root.
    pub bundle: PathBuf,
}

impl SourceRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub region_db_url: String,
    pub precinct_index: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub issue_log: PathBuf,
    pub geocoder_url: String,
    pub geocoder_countries: String,
    pub wiki_api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub throttle_ms: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("RALLY_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://rally.db".to_string()),
            region_db_url: std::env::var("RALLY_REGION_DB_URL")
                .unwrap_or_else(|_| "sqlite://regions.db".to_string()),
            precinct_index: std::env::var("RALLY_PRECINCT_INDEX")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            cache_dir: std::env::var("RALLY_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            issue_log: std::env::var("RALLY_ISSUE_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports/issues.log")),
            geocoder_url: std::env::var("RALLY_GEOCODER_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/search".to_string()),
            geocoder_countries: std::env::var("RALLY_GEOCODER_COUNTRIES")
                .unwrap_or_else(|_| "us".to_string()),
            wiki_api_url: std::env::var("RALLY_WIKI_API_URL")
                .unwrap_or_else(|_| "https://en.wikipedia.org/w/api.php".to_string()),
            user_agent: std::env::var("RALLY_USER_AGENT")
                .unwrap_or_else(|_| "rally-map-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("RALLY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            throttle_ms: std::env::var("RALLY_THROTTLE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            scheduler_enabled: std::env::var("RALLY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("RALLY_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            workspace_root: std::env::var("RALLY_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            throttle_every: Duration::from_millis(self.throttle_ms),
            ..Default::default()
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

async fn open_cache<V>(name: &str, path: PathBuf) -> Result<ResolverCache<V>>
where
    V: Serialize + serde::de::DeserializeOwned + Clone + Send,
{
    let display = path.display().to_string();
    ResolverCache::open(name, Box::new(JsonLinesBackend::new(path)))
        .await
        .with_context(|| format!("opening {name} cache {display}"))
}

/// Everything the pipeline needs besides rows. Setup failures here are
/// fatal for the run.
async fn build_pipeline(config: &SyncConfig) -> Result<EnrichmentPipeline> {
    let store = DestinationStore::open(&config.database_url).await?;
    store.reset().await?;

    let region_store = SqliteRegionStore::connect(&config.region_db_url).await?;
    let mut regions = RegionSpatialIndex::new(Arc::new(region_store));
    if let Some(path) = &config.precinct_index {
        let precincts = load_precinct_index(path).await?;
        regions = regions.with_precincts(Arc::new(precincts));
    }

    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let http = Arc::new(http);
    let geocoder = NominatimGeocoder::new(
        http.clone(),
        config.geocoder_url.clone(),
        config.geocoder_countries.clone(),
    );
    let encyclopedia = WikipediaClient::new(http, config.wiki_api_url.clone());

    let addresses = AddressResolver::new(
        Arc::new(geocoder),
        open_cache("address", config.cache_dir.join(ADDRESS_CACHE_FILE)).await?,
    );
    let cities = CityInfoResolver::new(
        Arc::new(encyclopedia),
        open_cache("city", config.cache_dir.join(CITY_CACHE_FILE)).await?,
    );
    let issues = IssueLog::append_to(&config.issue_log).await?;

    Ok(EnrichmentPipeline::new(addresses, cities, regions, store, issues))
}

/// Feed every enabled source through the pipeline and close the run.
pub async fn run_sources(
    mut pipeline: EnrichmentPipeline,
    sources: &[Box<dyn RowSource>],
) -> Result<RunSummary> {
    for source in sources {
        let rows = source
            .fetch_rows()
            .await
            .with_context(|| format!("loading rows for {}", source.sheet_id()))?;
        info!(sheet = source.sheet_id(), counts = ?shape_counts(&rows), "sheet loaded");
        pipeline.process_rows(source.sheet_id(), rows).await?;
    }
    Ok(pipeline.finish())
}

pub async fn run_sync_once(config: SyncConfig) -> Result<RunSummary> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let sources = registry
        .enabled()
        .map(|s| {
            Box::new(BundleRowSource::new(
                s.sheet_id.clone(),
                s.kind,
                config.workspace_root.join(&s.bundle),
            )) as Box<dyn RowSource>
        })
        .collect::<Vec<_>>();
    info!(sources = sources.len(), "starting enrichment run");

    let pipeline = build_pipeline(&config).await?;
    let summary = run_sources(pipeline, &sources).await?;
    let reports_dir = write_reports(&config.reports_root(), &summary).await?;
    info!(reports = %reports_dir.display(), "reports written");
    Ok(summary)
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    run_sync_once(SyncConfig::from_env()).await
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let issues = if stats.issue_counts.is_empty() {
        "- none".to_string()
    } else {
        stats
            .issue_counts
            .iter()
            .map(|(category, count)| format!("- {category}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Rally Map Run Brief\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Elapsed: {:.1}s\n\
         - Rows: {} total, {} processed\n\
         - Added: {}\n\
         - Rejects: {} ({:.1}%)\n\
         - Duplicates: {}\n\
         - Warnings: {}\n\
         - Geocode calls: {} ({} cache hits)\n\
         - Encyclopedia calls: {} ({} cache hits)\n\
         - Status: {}\n\n\
         ## Issues\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.elapsed_seconds,
        stats.rows_total,
        stats.rows_processed,
        stats.added,
        stats.rejects,
        stats.reject_ratio() * 100.0,
        stats.duplicates,
        stats.warnings,
        stats.geocode_calls,
        stats.geocode_cache_hits,
        stats.encyclopedia_calls,
        stats.encyclopedia_cache_hits,
        if summary.suspicious { "SUSPICIOUS" } else { "ok" },
        issues
    )
}

/// `reports/<run_id>/summary.json` and `run_brief.md`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(reports_dir)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Live entries kept per cache file.
    pub kept: BTreeMap<String, usize>,
}

/// Rewrite both resolver caches to one line per key.
pub async fn compact_caches(cache_dir: &Path) -> Result<CompactionReport> {
    let mut report = CompactionReport::default();

    let mut addresses: ResolverCache<rally_core::GeocodeResult> =
        open_cache("address", cache_dir.join(ADDRESS_CACHE_FILE)).await?;
    let kept = addresses.compact().await.context("compacting address cache")?;
    report.kept.insert(ADDRESS_CACHE_FILE.to_string(), kept);

    let mut cities: ResolverCache<rally_core::CityInfo> =
        open_cache("city", cache_dir.join(CITY_CACHE_FILE)).await?;
    let kept = cities.compact().await.context("compacting city cache")?;
    report.kept.insert(CITY_CACHE_FILE.to_string(), kept);

    info!(kept = ?report.kept, "caches compacted");
    Ok(report)
}

/// Cron-driven runs, when enabled. The caller starts the scheduler.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job_config = config.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_sync_once(config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.stats.added,
                    rejects = summary.stats.rejects,
                    "scheduled run finished"
                ),
                Err(err) => error!(error = ?err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
