//! Per-row enrichment: sanitize, resolve location, resolve city, tag
//! regions, dedup, persist.
//!
//! Rows run one at a time in source order. Row-level failures become
//! categorized issues; only infrastructure failures (store, region store,
//! cache backend) escape as errors and abort the run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rally_core::{
    CleanRecord, EnrichedRecord, GeocodeResult, Issue, IssueCategory, LocationInfo, RawRecord,
    Severity,
};
use rally_ingest::RowShapeError;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cityinfo::{CityInfoError, CityInfoResolver};
use crate::dedup::{Identity, IdentityDeduplicator};
use crate::geocode::{AddressError, AddressResolver};
use crate::regions::RegionSpatialIndex;
use crate::sanitize::sanitize;
use crate::store::{DestinationStore, PersistRequest};

/// Runs with more than this share of rejects are flagged suspicious.
pub const SUSPICIOUS_REJECT_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStage {
    Sanitizing,
    LocationResolving,
    CityResolving,
    RegionTagging,
    Deduplicating,
}

impl fmt::Display for RowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RowStage::Sanitizing => "sanitizing",
            RowStage::LocationResolving => "location",
            RowStage::CityResolving => "city",
            RowStage::RegionTagging => "regions",
            RowStage::Deduplicating => "dedup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Persisted(Uuid),
    Rejected(IssueCategory),
    Duplicate,
}

/// Append-only, human-readable issue log. File-backed logs also keep the
/// lines written this run in memory.
pub struct IssueLog {
    file: Option<File>,
    path: Option<PathBuf>,
    lines: Vec<String>,
}

impl IssueLog {
    pub fn in_memory() -> Self {
        Self {
            file: None,
            path: None,
            lines: Vec::new(),
        }
    }

    pub async fn append_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening issue log {}", path.display()))?;
        Ok(Self {
            file: Some(file),
            path: Some(path.to_path_buf()),
            lines: Vec::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn format_line(at: DateTime<Utc>, issue: &Issue) -> String {
        let severity = match issue.severity() {
            Severity::HardReject => "HARD_REJECT",
            Severity::SoftWarn => "SOFT_WARN",
        };
        format!(
            "{} [{}] row {} {} {}: {}",
            at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            issue.sheet,
            issue.row_index,
            severity,
            issue.category,
            issue.reason
        )
    }

    pub async fn record(&mut self, issue: &Issue) -> Result<()> {
        let line = Self::format_line(Utc::now(), issue);
        if let Some(file) = self.file.as_mut() {
            file.write_all(format!("{line}\n").as_bytes())
                .await
                .context("appending to issue log")?;
            file.flush().await.context("flushing issue log")?;
        }
        self.lines.push(line);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub rows_total: usize,
    pub rows_processed: usize,
    pub added: usize,
    pub rejects: usize,
    pub duplicates: usize,
    pub warnings: usize,
    pub issue_counts: BTreeMap<IssueCategory, usize>,
    pub geocode_calls: u64,
    pub geocode_cache_hits: u64,
    pub encyclopedia_calls: u64,
    pub encyclopedia_cache_hits: u64,
}

impl RunStats {
    pub fn reject_ratio(&self) -> f64 {
        if self.rows_processed == 0 {
            0.0
        } else {
            self.rejects as f64 / self.rows_processed as f64
        }
    }

    pub fn is_suspicious(&self) -> bool {
        self.reject_ratio() > SUSPICIOUS_REJECT_RATIO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    #[serde(flatten)]
    pub stats: RunStats,
    pub suspicious: bool,
}

pub struct EnrichmentPipeline {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    addresses: AddressResolver,
    cities: CityInfoResolver,
    regions: RegionSpatialIndex,
    dedup: IdentityDeduplicator,
    store: DestinationStore,
    issues: IssueLog,
    stats: RunStats,
}

impl EnrichmentPipeline {
    pub fn new(
        addresses: AddressResolver,
        cities: CityInfoResolver,
        regions: RegionSpatialIndex,
        store: DestinationStore,
        issues: IssueLog,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            addresses,
            cities,
            regions,
            dedup: IdentityDeduplicator::new(),
            store,
            issues,
            stats: RunStats::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn issues(&self) -> &IssueLog {
        &self.issues
    }

    pub fn store(&self) -> &DestinationStore {
        &self.store
    }

    pub fn addresses_mut(&mut self) -> &mut AddressResolver {
        &mut self.addresses
    }

    pub fn cities_mut(&mut self) -> &mut CityInfoResolver {
        &mut self.cities
    }

    /// Feed a shaped batch through in order.
    pub async fn process_rows(
        &mut self,
        sheet: &str,
        rows: Vec<Result<RawRecord, RowShapeError>>,
    ) -> Result<()> {
        for row in rows {
            match row {
                Ok(raw) => {
                    self.process(&raw).await?;
                }
                Err(err) => self.record_malformed(sheet, &err).await?,
            }
        }
        Ok(())
    }

    /// A row the ingestion boundary could not shape. Counted as a reject.
    pub async fn record_malformed(&mut self, sheet: &str, err: &RowShapeError) -> Result<()> {
        self.stats.rows_total += 1;
        self.stats.rows_processed += 1;
        let issue = Issue::new(
            sheet,
            err.row_index(),
            IssueCategory::MalformedRow,
            err.to_string(),
        );
        self.reject(&issue).await
    }

    /// Run one row to a terminal outcome. `Err` is fatal for the run.
    pub async fn process(&mut self, raw: &RawRecord) -> Result<RowOutcome> {
        self.stats.rows_total += 1;
        let span = info_span!("row", sheet = %raw.sheet, row = raw.row_index);
        let outcome = self.run_row(raw).instrument(span).await?;
        self.stats.rows_processed += 1;
        Ok(outcome)
    }

    async fn run_row(&mut self, raw: &RawRecord) -> Result<RowOutcome> {
        debug!(stage = %RowStage::Sanitizing);
        let sanitized = match sanitize(raw) {
            Ok(sanitized) => sanitized,
            Err(issue) => {
                self.reject(&issue).await?;
                return Ok(RowOutcome::Rejected(issue.category));
            }
        };
        for warning in &sanitized.warnings {
            self.warn(warning).await?;
        }
        let record = sanitized.record;

        debug!(stage = %RowStage::LocationResolving);
        let geocoded = match self.addresses.resolve(&record.address).await {
            Ok(geocoded) => geocoded,
            Err(AddressError::Cache(err)) => {
                return Err(err).context("address cache backend failed");
            }
            Err(err) => {
                return self
                    .reject_row(&record, IssueCategory::BadAddress, err.to_string())
                    .await;
            }
        };

        debug!(stage = %RowStage::CityResolving);
        let city_info = match self
            .cities
            .resolve(&record.address.city, &record.address.state)
            .await
        {
            Ok(Some(info)) => info,
            Ok(None) => {
                let reason = format!(
                    "no encyclopedia place for {:?}, {:?}",
                    record.address.city, record.address.state
                );
                return self.reject_row(&record, IssueCategory::BadCity, reason).await;
            }
            Err(CityInfoError::Cache(err)) => {
                return Err(err).context("city cache backend failed");
            }
            Err(err @ CityInfoError::Transport { .. }) => {
                return self
                    .reject_row(&record, IssueCategory::BadCity, err.to_string())
                    .await;
            }
        };

        debug!(stage = %RowStage::RegionTagging);
        let GeocodeResult {
            latitude,
            longitude,
            display_name,
        } = geocoded;
        let regions = self
            .regions
            .regions_containing(latitude, longitude)
            .await
            .context("region lookup failed")?;
        let voting_lean = self
            .regions
            .voting_lean_at(latitude, longitude)
            .await
            .context("precinct lookup failed")?;

        let enriched = EnrichedRecord {
            location: LocationInfo {
                latitude,
                longitude,
                display_name,
                city: record.address.city.clone(),
                state: record.address.state.clone(),
                city_info,
                voting_lean,
            },
            regions,
            record,
        };

        debug!(stage = %RowStage::Deduplicating);
        let record_key = IdentityDeduplicator::key_for(Identity::Record {
            record: &enriched.record,
            latitude,
            longitude,
        });
        if self.dedup.has_seen(&record_key) {
            debug!(key = %record_key, "duplicate skipped");
            self.stats.duplicates += 1;
            return Ok(RowOutcome::Duplicate);
        }
        let location_key =
            IdentityDeduplicator::key_for(Identity::Location(&enriched.record.address));
        let city_key = IdentityDeduplicator::key_for(Identity::City {
            city: &enriched.record.address.city,
            state: &enriched.record.address.state,
        });

        let id = self
            .store
            .persist(&PersistRequest {
                enriched: &enriched,
                record_key: &record_key,
                location_key: &location_key,
                city_key: &city_key,
                location_is_new: !self.dedup.has_seen(&location_key),
                city_is_new: !self.dedup.has_seen(&city_key),
            })
            .await?;
        self.dedup.mark_seen(&city_key);
        self.dedup.mark_seen(&location_key);
        self.dedup.mark_seen(&record_key);
        self.stats.added += 1;
        debug!(%id, regions = enriched.regions.len(), "persisted");
        Ok(RowOutcome::Persisted(id))
    }

    async fn reject_row(
        &mut self,
        record: &CleanRecord,
        category: IssueCategory,
        reason: String,
    ) -> Result<RowOutcome> {
        let issue = Issue::new(record.sheet.clone(), record.row_index, category, reason);
        self.reject(&issue).await?;
        Ok(RowOutcome::Rejected(category))
    }

    async fn reject(&mut self, issue: &Issue) -> Result<()> {
        info!(category = %issue.category, reason = %issue.reason, "row rejected");
        self.stats.rejects += 1;
        self.count_issue(issue);
        self.issues.record(issue).await
    }

    async fn warn(&mut self, issue: &Issue) -> Result<()> {
        warn!(category = %issue.category, reason = %issue.reason, "row degraded");
        self.stats.warnings += 1;
        self.count_issue(issue);
        self.issues.record(issue).await
    }

    fn count_issue(&mut self, issue: &Issue) {
        *self.stats.issue_counts.entry(issue.category).or_default() += 1;
    }

    fn snapshot_calls(&mut self) {
        self.stats.geocode_calls = self.addresses.network_calls();
        self.stats.geocode_cache_hits = self.addresses.cache_hits();
        self.stats.encyclopedia_calls = self.cities.network_calls();
        self.stats.encyclopedia_cache_hits = self.cities.cache_hits();
    }

    /// Close the run and hand back its summary.
    pub fn finish(mut self) -> RunSummary {
        self.snapshot_calls();
        let finished_at = Utc::now();
        let elapsed_seconds = (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let summary = RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            elapsed_seconds,
            suspicious: self.stats.is_suspicious(),
            stats: self.stats,
        };
        info!(
            run_id = %summary.run_id,
            processed = summary.stats.rows_processed,
            added = summary.stats.added,
            rejects = summary.stats.rejects,
            duplicates = summary.stats.duplicates,
            suspicious = summary.suspicious,
            "enrichment run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rally_core::RecordKind;
    use rally_storage::ResolverCache;

    use super::*;
    use crate::cityinfo::fakes::FakeEncyclopedia;
    use crate::geocode::fakes::FakeGeocoder;
    use crate::geocode::GeocodeQuery;
    use crate::regions::SqliteRegionStore;

    fn springfield_postal_query() -> GeocodeQuery {
        GeocodeQuery::Structured {
            street: None,
            city: "Springfield".into(),
            state: "IL".into(),
            postalcode: Some("62704".into()),
            country: String::new(),
        }
    }

    fn encyclopedia() -> FakeEncyclopedia {
        FakeEncyclopedia::default()
            .search("Springfield, Illinois", &["Springfield, Illinois"])
            .page("Springfield, Illinois", &["Category:Cities in Illinois"], None)
    }

    async fn pipeline(
        geocoder: FakeGeocoder,
        encyclopedia: FakeEncyclopedia,
    ) -> EnrichmentPipeline {
        let store = DestinationStore::in_memory().await.expect("store");
        store.reset().await.expect("reset");
        let regions = SqliteRegionStore::in_memory().await.expect("regions");
        EnrichmentPipeline::new(
            AddressResolver::new(Arc::new(geocoder), ResolverCache::in_memory("address")),
            CityInfoResolver::new(Arc::new(encyclopedia), ResolverCache::in_memory("city")),
            RegionSpatialIndex::new(Arc::new(regions)),
            store,
            IssueLog::in_memory(),
        )
    }

    fn row(index: usize) -> RawRecord {
        RawRecord {
            sheet: "events".into(),
            row_index: index,
            kind: Some(RecordKind::Event),
            date: "6/14/2025".into(),
            name: "no kings rally".into(),
            city: "Springfield".into(),
            state: "IL".into(),
            zip: "62704".into(),
            link: "https://example.org/e/1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn city_failure_rejects_but_keeps_address_cached() {
        let geocoder = FakeGeocoder::default().answering(springfield_postal_query(), 39.78, -89.65);
        let mut pipeline = pipeline(geocoder, FakeEncyclopedia::default()).await;

        let outcome = pipeline.process(&row(1)).await.expect("row");
        assert_eq!(outcome, RowOutcome::Rejected(IssueCategory::BadCity));
        assert_eq!(pipeline.addresses_mut().cache().good_count(), 1);
        assert_eq!(pipeline.store().count("events").await.expect("count"), 0);

        let line = &pipeline.issues().lines()[0];
        assert!(line.contains("[events] row 1 HARD_REJECT Bad city"), "{line}");
    }

    #[tokio::test]
    async fn repeated_city_reuses_one_city_row() {
        let geocoder = FakeGeocoder::default().answering(springfield_postal_query(), 39.78, -89.65);
        let mut pipeline = pipeline(geocoder, encyclopedia()).await;

        let first = row(1);
        let mut second = row(2);
        second.name = "hands off".into();

        assert!(matches!(pipeline.process(&first).await.expect("row"), RowOutcome::Persisted(_)));
        assert!(matches!(pipeline.process(&second).await.expect("row"), RowOutcome::Persisted(_)));
        assert_eq!(pipeline.store().count("events").await.expect("count"), 2);
        assert_eq!(pipeline.store().count("city_info").await.expect("count"), 1);
        assert_eq!(pipeline.store().count("location_info").await.expect("count"), 1);

        let summary = pipeline.finish();
        assert_eq!(summary.stats.added, 2);
        assert_eq!(summary.stats.geocode_calls, 1);
        assert_eq!(summary.stats.geocode_cache_hits, 1);
        assert_eq!(summary.stats.encyclopedia_calls, 3);
        assert!(!summary.suspicious);
    }

    #[tokio::test]
    async fn malformed_rows_count_as_rejects() {
        let mut pipeline = pipeline(FakeGeocoder::default(), FakeEncyclopedia::default()).await;
        pipeline
            .process_rows("events", vec![Err(RowShapeError::Blank { row_index: 4 })])
            .await
            .expect("batch");
        let stats = pipeline.stats();
        assert_eq!(stats.rejects, 1);
        assert_eq!(stats.issue_counts.get(&IssueCategory::MalformedRow), Some(&1));
        assert!(stats.is_suspicious());
    }

    #[tokio::test]
    async fn issue_log_appends_across_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("issues.log");
        let issue = Issue::new("events", 3, IssueCategory::BadZipcode, "invalid zipcode \"1234\"");

        let mut log = IssueLog::append_to(&path).await.expect("open");
        log.record(&issue).await.expect("record");
        drop(log);
        let mut log = IssueLog::append_to(&path).await.expect("reopen");
        log.record(&issue).await.expect("record");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 2);
        let expected = "[events] row 3 SOFT_WARN Bad zipcode: invalid zipcode \"1234\"";
        assert!(text.lines().all(|l| l.ends_with(expected)));
    }

    #[test]
    fn summary_serializes_flat() {
        let mut stats = RunStats {
            rows_processed: 10,
            rejects: 2,
            ..Default::default()
        };
        stats.issue_counts.insert(IssueCategory::BadDate, 2);
        assert!(stats.is_suspicious());

        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_seconds: 0.5,
            suspicious: stats.is_suspicious(),
            stats,
        };
        let json = serde_json::to_value(&summary).expect("json");
        assert_eq!(json["rejects"], 2);
        assert_eq!(json["issue_counts"]["bad_date"], 2);
        assert_eq!(json["suspicious"], true);
    }
}
