//! Write side of the destination store.
//!
//! The store is cleared and rebuilt on every run. Each record is written
//! in its own transaction together with any new location/city rows and its
//! region links.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rally_core::{EnrichedRecord, RecordKind, RegionId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::dedup::IdentityKey;

const DROP_TABLES: &[&str] = &[
    "DROP TABLE IF EXISTS event_regions",
    "DROP TABLE IF EXISTS turnout_regions",
    "DROP TABLE IF EXISTS events",
    "DROP TABLE IF EXISTS turnouts",
    "DROP TABLE IF EXISTS location_info",
    "DROP TABLE IF EXISTS city_info",
];

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE city_info (
        id INTEGER PRIMARY KEY,
        city_key TEXT NOT NULL UNIQUE,
        city TEXT NOT NULL,
        state TEXT NOT NULL,
        article_url TEXT NOT NULL,
        thumbnail_url TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE location_info (
        id INTEGER PRIMARY KEY,
        location_key TEXT NOT NULL UNIQUE,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        display_name TEXT NOT NULL,
        address TEXT NOT NULL,
        zip TEXT NOT NULL,
        city_info_id INTEGER NOT NULL REFERENCES city_info(id),
        voting_lean REAL
    )
    "#,
    r#"
    CREATE TABLE events (
        id TEXT PRIMARY KEY,
        identity_hash TEXT NOT NULL UNIQUE,
        sheet TEXT NOT NULL,
        row_index INTEGER NOT NULL,
        date TEXT NOT NULL,
        name TEXT NOT NULL,
        link TEXT,
        location_id INTEGER NOT NULL REFERENCES location_info(id),
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        voting_lean REAL,
        extensions TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE turnouts (
        id TEXT PRIMARY KEY,
        identity_hash TEXT NOT NULL UNIQUE,
        sheet TEXT NOT NULL,
        row_index INTEGER NOT NULL,
        date TEXT NOT NULL,
        name TEXT NOT NULL,
        link TEXT,
        coverage_url TEXT,
        low_estimate INTEGER,
        high_estimate INTEGER,
        location_id INTEGER NOT NULL REFERENCES location_info(id),
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        voting_lean REAL,
        extensions TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE event_regions (
        event_id TEXT NOT NULL REFERENCES events(id),
        region_id INTEGER NOT NULL,
        PRIMARY KEY (event_id, region_id)
    )
    "#,
    r#"
    CREATE TABLE turnout_regions (
        turnout_id TEXT NOT NULL REFERENCES turnouts(id),
        region_id INTEGER NOT NULL,
        PRIMARY KEY (turnout_id, region_id)
    )
    "#,
];

/// Everything needed to write one enriched record. The `*_is_new` flags come
/// from the seen-sets: a city or location already written this run is
/// linked by key rather than inserted again.
#[derive(Debug)]
pub struct PersistRequest<'a> {
    pub enriched: &'a EnrichedRecord,
    pub record_key: &'a IdentityKey,
    pub location_key: &'a IdentityKey,
    pub city_key: &'a IdentityKey,
    pub location_is_new: bool,
    pub city_is_new: bool,
}

/// A persisted record joined with its location and city, as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub name: String,
    pub date: String,
    pub latitude: f64,
    pub longitude: f64,
    pub zip: String,
    pub voting_lean: Option<f64>,
    pub article_url: String,
    pub coverage_url: Option<String>,
    pub turnout_low: Option<i64>,
    pub turnout_high: Option<i64>,
    pub regions: Vec<RegionId>,
}

fn record_table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Event => "events",
        RecordKind::Turnout => "turnouts",
    }
}

fn junction(kind: RecordKind) -> (&'static str, &'static str) {
    match kind {
        RecordKind::Event => ("event_regions", "event_id"),
        RecordKind::Turnout => ("turnout_regions", "turnout_id"),
    }
}

fn estimate(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone)]
pub struct DestinationStore {
    pool: SqlitePool,
}

impl DestinationStore {
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing destination store url {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        // Single writer for the whole run.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening destination store {url}"))?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .context("opening in-memory destination store")?;
        Ok(Self { pool })
    }

    /// Drop and recreate every table.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in DROP_TABLES.iter().chain(CREATE_TABLES) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .context("resetting destination schema")?;
        }
        tx.commit().await.context("committing destination reset")?;
        Ok(())
    }

    /// Write the record, its location/city rows when new, and its region
    /// links, atomically. Returns the record's id.
    pub async fn persist(&self, request: &PersistRequest<'_>) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        let city_id = self.city_row(&mut tx, request).await?;
        let location_id = self.location_row(&mut tx, request, city_id).await?;
        let id = self.record_row(&mut tx, request, location_id).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing record {}", request.record_key))?;
        Ok(id)
    }

    async fn city_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        request: &PersistRequest<'_>,
    ) -> Result<i64> {
        let location = &request.enriched.location;
        if request.city_is_new {
            let id = sqlx::query(
                r#"
                INSERT INTO city_info (city_key, city, state, article_url, thumbnail_url)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(request.city_key.as_str())
            .bind(&location.city)
            .bind(&location.state)
            .bind(&location.city_info.article_url)
            .bind(&location.city_info.thumbnail_url)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("inserting city {}", request.city_key))?
            .last_insert_rowid();
            return Ok(id);
        }
        let row = sqlx::query("SELECT id FROM city_info WHERE city_key = ?")
            .bind(request.city_key.as_str())
            .fetch_one(&mut **tx)
            .await
            .with_context(|| format!("looking up city {}", request.city_key))?;
        Ok(row.try_get("id")?)
    }

    async fn location_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        request: &PersistRequest<'_>,
        city_id: i64,
    ) -> Result<i64> {
        let location = &request.enriched.location;
        let address = &request.enriched.record.address;
        if request.location_is_new {
            let id = sqlx::query(
                r#"
                INSERT INTO location_info
                    (location_key, latitude, longitude, display_name, address, zip,
                     city_info_id, voting_lean)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(request.location_key.as_str())
            .bind(location.latitude)
            .bind(location.longitude)
            .bind(&location.display_name)
            .bind(&address.address)
            .bind(&address.zip)
            .bind(city_id)
            .bind(location.voting_lean)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("inserting location {}", request.location_key))?
            .last_insert_rowid();
            return Ok(id);
        }
        let row = sqlx::query("SELECT id FROM location_info WHERE location_key = ?")
            .bind(request.location_key.as_str())
            .fetch_one(&mut **tx)
            .await
            .with_context(|| format!("looking up location {}", request.location_key))?;
        Ok(row.try_get("id")?)
    }

    async fn record_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        request: &PersistRequest<'_>,
        location_id: i64,
    ) -> Result<Uuid> {
        let enriched = request.enriched;
        let record = &enriched.record;
        let location = &enriched.location;
        let id = request.record_key.uuid();
        let extensions =
            serde_json::to_string(&record.extensions).context("serializing extensions")?;
        let row_index = i64::try_from(record.row_index).unwrap_or(i64::MAX);

        let inserted = match record.kind {
            RecordKind::Event => {
                sqlx::query(
                    r#"
                    INSERT INTO events
                        (id, identity_hash, sheet, row_index, date, name, link, location_id,
                         latitude, longitude, voting_lean, extensions)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id.to_string())
                .bind(request.record_key.digest())
                .bind(&record.sheet)
                .bind(row_index)
                .bind(record.canonical_date())
                .bind(&record.name)
                .bind(record.link.as_deref())
                .bind(location_id)
                .bind(location.latitude)
                .bind(location.longitude)
                .bind(location.voting_lean)
                .bind(&extensions)
                .execute(&mut **tx)
                .await
            }
            RecordKind::Turnout => {
                sqlx::query(
                    r#"
                    INSERT INTO turnouts
                        (id, identity_hash, sheet, row_index, date, name, link, coverage_url,
                         low_estimate, high_estimate, location_id, latitude, longitude,
                         voting_lean, extensions)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id.to_string())
                .bind(request.record_key.digest())
                .bind(&record.sheet)
                .bind(row_index)
                .bind(record.canonical_date())
                .bind(&record.name)
                .bind(record.link.as_deref())
                .bind(record.coverage_url.as_deref())
                .bind(estimate(record.turnout_low))
                .bind(estimate(record.turnout_high))
                .bind(location_id)
                .bind(location.latitude)
                .bind(location.longitude)
                .bind(location.voting_lean)
                .bind(&extensions)
                .execute(&mut **tx)
                .await
            }
        };
        inserted.with_context(|| format!("inserting {} {}", record.kind, request.record_key))?;

        let (table, column) = junction(record.kind);
        let link_sql = format!("INSERT OR IGNORE INTO {table} ({column}, region_id) VALUES (?, ?)");
        for region in &enriched.regions {
            sqlx::query(&link_sql)
                .bind(id.to_string())
                .bind(region.0)
                .execute(&mut **tx)
                .await
                .with_context(|| format!("linking {} to region {}", request.record_key, region.0))?;
        }
        Ok(id)
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let known = DROP_TABLES.iter().any(|stmt| stmt.ends_with(&format!(" {table}")));
        anyhow::ensure!(known, "unknown table {table}");
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting {table}"))?;
        Ok(row.try_get("n")?)
    }

    /// Records of one kind joined with location and city, in insertion order.
    pub async fn stored_records(&self, kind: RecordKind) -> Result<Vec<StoredRecord>> {
        let table = record_table(kind);
        let (junction_table, column) = junction(kind);
        let turnout_columns = match kind {
            RecordKind::Event => {
                "NULL AS coverage_url, NULL AS low_estimate, NULL AS high_estimate"
            }
            RecordKind::Turnout => "r.coverage_url, r.low_estimate, r.high_estimate",
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT r.id, r.name, r.date, r.latitude, r.longitude, r.voting_lean,
                   {turnout_columns}, l.zip, c.article_url
              FROM {table} r
              JOIN location_info l ON l.id = r.location_id
              JOIN city_info c ON c.id = l.city_info_id
             ORDER BY r.rowid
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading {table}"))?;

        let region_sql = format!(
            "SELECT region_id FROM {junction_table} WHERE {column} = ? ORDER BY region_id"
        );
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let regions = sqlx::query(&region_sql)
                .bind(&id)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|r| -> Result<RegionId> { Ok(RegionId(r.try_get("region_id")?)) })
                .collect::<Result<Vec<_>>>()?;
            out.push(StoredRecord {
                id,
                name: row.try_get("name")?,
                date: row.try_get("date")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                zip: row.try_get("zip")?,
                voting_lean: row.try_get("voting_lean")?,
                article_url: row.try_get("article_url")?,
                coverage_url: row.try_get("coverage_url")?,
                turnout_low: row.try_get("low_estimate")?,
                turnout_high: row.try_get("high_estimate")?,
                regions,
            });
        }
        Ok(out)
    }
}
