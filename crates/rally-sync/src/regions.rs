//! Region tagging and voting lean.
//!
//! Both lookups run the same two stages: an R*Tree bounding-box query for
//! candidates, then an exact point-in-polygon test on each candidate's
//! stored GeoJSON boundary.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use geo::{BoundingRect, Contains, Coord, LineString, MultiPolygon, Point, Polygon};
use rally_core::RegionId;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("geometry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported geometry type {0:?}")]
    Unsupported(String),
    #[error("malformed geometry: {0}")]
    Malformed(String),
}

fn malformed(reason: &str) -> GeometryError {
    GeometryError::Malformed(reason.to_string())
}

/// Parse a GeoJSON `Polygon`, `MultiPolygon`, or a `Feature` wrapping one.
pub fn parse_geometry(text: &str) -> Result<MultiPolygon<f64>, GeometryError> {
    let value: JsonValue = serde_json::from_str(text)?;
    geometry_from_value(&value)
}

fn geometry_from_value(value: &JsonValue) -> Result<MultiPolygon<f64>, GeometryError> {
    let kind = value
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| malformed("missing type"))?;
    match kind {
        "Feature" => geometry_from_value(
            value
                .get("geometry")
                .ok_or_else(|| malformed("feature without geometry"))?,
        ),
        "Polygon" => Ok(MultiPolygon::new(vec![polygon(coordinates(value)?)?])),
        "MultiPolygon" => {
            let polygons = coordinates(value)?
                .as_array()
                .ok_or_else(|| malformed("multipolygon coordinates are not an array"))?
                .iter()
                .map(polygon)
                .collect::<Result<Vec<_>, _>>()?;
            if polygons.is_empty() {
                return Err(malformed("empty multipolygon"));
            }
            Ok(MultiPolygon::new(polygons))
        }
        other => Err(GeometryError::Unsupported(other.to_string())),
    }
}

fn coordinates(value: &JsonValue) -> Result<&JsonValue, GeometryError> {
    value
        .get("coordinates")
        .ok_or_else(|| malformed("missing coordinates"))
}

fn polygon(value: &JsonValue) -> Result<Polygon<f64>, GeometryError> {
    let mut rings = value
        .as_array()
        .ok_or_else(|| malformed("polygon is not an array of rings"))?
        .iter()
        .map(ring);
    let exterior = rings
        .next()
        .ok_or_else(|| malformed("polygon without exterior ring"))??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring(value: &JsonValue) -> Result<LineString<f64>, GeometryError> {
    let coords = value
        .as_array()
        .ok_or_else(|| malformed("ring is not an array of positions"))?
        .iter()
        .map(position)
        .collect::<Result<Vec<_>, _>>()?;
    if coords.len() < 3 {
        return Err(malformed("ring has fewer than three positions"));
    }
    Ok(LineString::new(coords))
}

fn position(value: &JsonValue) -> Result<Coord<f64>, GeometryError> {
    match value.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => Ok(Coord {
            x: x.as_f64().ok_or_else(|| malformed("longitude is not a number"))?,
            y: y.as_f64().ok_or_else(|| malformed("latitude is not a number"))?,
        }),
        _ => Err(malformed("position needs longitude and latitude")),
    }
}

/// Signed lean in percent: a `lean` property wins, else
/// `(dem - rep) / (dem + rep) * 100` from `votes_dem` / `votes_rep`.
pub fn lean_from_properties(properties: &JsonValue) -> Option<f64> {
    let number = |key: &str| {
        properties.get(key).and_then(|v| match v {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    };
    if let Some(lean) = number("lean") {
        return Some(lean);
    }
    let dem = number("votes_dem")?;
    let rep = number("votes_rep")?;
    let total = dem + rep;
    (total > 0.0).then(|| (dem - rep) / total * 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionRecord {
    pub id: RegionId,
    pub name: String,
    pub kind: String,
    /// GeoJSON boundary; regions without one match on their bounding box.
    pub geometry: Option<String>,
    pub lean: Option<f64>,
}

/// Read side of a spatial region store.
#[async_trait]
pub trait RegionStore: Send + Sync {
    /// Regions whose bounding box contains the point.
    async fn candidates(&self, lat: f64, lon: f64) -> Result<Vec<RegionId>>;
    async fn region(&self, id: RegionId) -> Result<Option<RegionRecord>>;
}

const REGION_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS regions (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        geometry TEXT,
        lean REAL
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS regions_rtree
        USING rtree(id, min_lon, max_lon, min_lat, max_lat)
    "#,
];

const INSERT_RTREE: &str =
    "INSERT INTO regions_rtree (id, min_lon, max_lon, min_lat, max_lat) VALUES (?, ?, ?, ?, ?)";

/// SQLite region store: a `regions` table plus an R*Tree of bounding boxes.
#[derive(Debug, Clone)]
pub struct SqliteRegionStore {
    pool: SqlitePool,
}

impl SqliteRegionStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing region store url {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening region store {url}"))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Private in-memory store. A single pinned connection keeps the
    /// database alive for the life of the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory region store")?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in REGION_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating region schema")?;
        }
        Ok(())
    }

    /// Insert a region from its GeoJSON boundary; the bounding box is derived.
    pub async fn insert_geojson(
        &self,
        name: &str,
        kind: &str,
        geometry: &str,
        lean: Option<f64>,
    ) -> Result<RegionId> {
        let shape = parse_geometry(geometry).with_context(|| format!("region {name}"))?;
        let bbox = shape
            .bounding_rect()
            .with_context(|| format!("region {name} has an empty boundary"))?;

        let mut tx = self.pool.begin().await?;
        let id = sqlx::query("INSERT INTO regions (name, kind, geometry, lean) VALUES (?, ?, ?, ?)")
            .bind(name)
            .bind(kind)
            .bind(geometry)
            .bind(lean)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        sqlx::query(INSERT_RTREE)
            .bind(id)
            .bind(bbox.min().x)
            .bind(bbox.max().x)
            .bind(bbox.min().y)
            .bind(bbox.max().y)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(RegionId(id))
    }

    /// Insert a region known only by its bounding box.
    pub async fn insert_bbox(
        &self,
        name: &str,
        kind: &str,
        (min_lon, min_lat): (f64, f64),
        (max_lon, max_lat): (f64, f64),
    ) -> Result<RegionId> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query("INSERT INTO regions (name, kind) VALUES (?, ?)")
            .bind(name)
            .bind(kind)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        sqlx::query(INSERT_RTREE)
            .bind(id)
            .bind(min_lon)
            .bind(max_lon)
            .bind(min_lat)
            .bind(max_lat)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(RegionId(id))
    }

    /// Load every polygon feature of a GeoJSON `FeatureCollection`.
    /// Features without a usable boundary are skipped with a warning.
    pub async fn import_feature_collection(&self, text: &str, kind: &str) -> Result<usize> {
        let collection: JsonValue =
            serde_json::from_str(text).context("parsing feature collection")?;
        let features = collection
            .get("features")
            .and_then(JsonValue::as_array)
            .context("feature collection without features array")?;

        let mut imported = 0usize;
        for (index, feature) in features.iter().enumerate() {
            let properties = feature.get("properties").cloned().unwrap_or(JsonValue::Null);
            let name = ["name", "NAME", "precinct", "PRECINCT"]
                .iter()
                .find_map(|key| properties.get(*key).and_then(JsonValue::as_str))
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{kind}-{index}"));
            let Some(geometry) = feature.get("geometry").filter(|g| !g.is_null()) else {
                warn!(kind, index, "feature without geometry skipped");
                continue;
            };
            let geometry = geometry.to_string();
            match self
                .insert_geojson(&name, kind, &geometry, lean_from_properties(&properties))
                .await
            {
                Ok(_) => imported += 1,
                Err(err) => warn!(kind, index, error = %err, "feature skipped"),
            }
        }
        Ok(imported)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM regions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl RegionStore for SqliteRegionStore {
    async fn candidates(&self, lat: f64, lon: f64) -> Result<Vec<RegionId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM regions_rtree
             WHERE min_lon <= ?1 AND max_lon >= ?1
               AND min_lat <= ?2 AND max_lat >= ?2
             ORDER BY id
            "#,
        )
        .bind(lon)
        .bind(lat)
        .fetch_all(&self.pool)
        .await
        .context("querying region bounding boxes")?;
        rows.iter()
            .map(|row| -> Result<RegionId> { Ok(RegionId(row.try_get("id")?)) })
            .collect()
    }

    async fn region(&self, id: RegionId) -> Result<Option<RegionRecord>> {
        let row = sqlx::query("SELECT name, kind, geometry, lean FROM regions WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading region {}", id.0))?;
        row.map(|row| -> Result<RegionRecord> {
            Ok(RegionRecord {
                id,
                name: row.try_get("name")?,
                kind: row.try_get("kind")?,
                geometry: row.try_get("geometry")?,
                lean: row.try_get("lean")?,
            })
        })
        .transpose()
    }
}

/// Load a precinct GeoJSON file into an in-memory store. Missing or
/// unparseable files, and files without a single usable precinct, are an
/// error.
pub async fn load_precinct_index(path: &Path) -> Result<SqliteRegionStore> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading precinct index {}", path.display()))?;
    let store = SqliteRegionStore::in_memory().await?;
    let imported = store
        .import_feature_collection(&text, "precinct")
        .await
        .with_context(|| format!("loading precinct index {}", path.display()))?;
    anyhow::ensure!(
        imported > 0,
        "precinct index {} has no usable precinct boundaries",
        path.display()
    );
    info!(path = %path.display(), precincts = imported, "precinct index loaded");
    Ok(store)
}

#[derive(Debug)]
enum Boundary {
    Exact(MultiPolygon<f64>),
    BoxOnly,
    Malformed,
}

#[derive(Debug)]
struct ResolvedRegion {
    boundary: Boundary,
    lean: Option<f64>,
}

impl ResolvedRegion {
    fn contains(&self, point: &Point<f64>) -> bool {
        match &self.boundary {
            Boundary::Exact(shape) => shape.contains(point),
            Boundary::BoxOnly => true,
            Boundary::Malformed => false,
        }
    }
}

/// Bounding-box candidates refined by exact containment, with parsed
/// boundaries memoized per region.
struct TwoStageLookup {
    store: Arc<dyn RegionStore>,
    resolved: HashMap<RegionId, Option<Arc<ResolvedRegion>>>,
}

impl TwoStageLookup {
    fn new(store: Arc<dyn RegionStore>) -> Self {
        Self {
            store,
            resolved: HashMap::new(),
        }
    }

    async fn containing(
        &mut self,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<(RegionId, Arc<ResolvedRegion>)>> {
        let point = Point::new(lon, lat);
        let mut hits = Vec::new();
        for id in self.store.candidates(lat, lon).await? {
            let Some(region) = self.resolve(id).await? else {
                continue;
            };
            if region.contains(&point) {
                hits.push((id, region));
            } else {
                debug!(region = id.0, lat, lon, "bounding box hit rejected by exact test");
            }
        }
        Ok(hits)
    }

    async fn resolve(&mut self, id: RegionId) -> Result<Option<Arc<ResolvedRegion>>> {
        if let Some(cached) = self.resolved.get(&id) {
            return Ok(cached.clone());
        }
        let resolved = self.store.region(id).await?.map(|record| {
            let boundary = match record.geometry.as_deref() {
                None => Boundary::BoxOnly,
                Some(text) => match parse_geometry(text) {
                    Ok(shape) => Boundary::Exact(shape),
                    Err(err) => {
                        warn!(
                            region = id.0,
                            name = %record.name,
                            error = %err,
                            "unusable region boundary"
                        );
                        Boundary::Malformed
                    }
                },
            };
            Arc::new(ResolvedRegion {
                boundary,
                lean: record.lean,
            })
        });
        self.resolved.insert(id, resolved.clone());
        Ok(resolved)
    }
}

pub struct RegionSpatialIndex {
    regions: TwoStageLookup,
    precincts: Option<TwoStageLookup>,
}

impl RegionSpatialIndex {
    pub fn new(regions: Arc<dyn RegionStore>) -> Self {
        Self {
            regions: TwoStageLookup::new(regions),
            precincts: None,
        }
    }

    pub fn with_precincts(mut self, precincts: Arc<dyn RegionStore>) -> Self {
        self.precincts = Some(TwoStageLookup::new(precincts));
        self
    }

    /// Ids of every region whose boundary contains the point, ascending.
    /// A point outside all regions yields an empty list.
    pub async fn regions_containing(&mut self, lat: f64, lon: f64) -> Result<Vec<RegionId>> {
        Ok(self
            .regions
            .containing(lat, lon)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Lean of the first containing precinct that carries one.
    pub async fn voting_lean_at(&mut self, lat: f64, lon: f64) -> Result<Option<f64>> {
        let Some(precincts) = self.precincts.as_mut() else {
            return Ok(None);
        };
        Ok(precincts
            .containing(lat, lon)
            .await?
            .into_iter()
            .find_map(|(_, region)| region.lean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A 10x10 degree block with a notch cut down from the north edge
    // between longitudes -86 and -84, down to latitude 34.
    const NOTCHED: &str = r#"{"type":"Polygon","coordinates":[[
        [-90,30],[-80,30],[-80,40],[-84,40],[-84,34],[-86,34],[-86,40],[-90,40],[-90,30]
    ]]}"#;

    const NORTH_SQUARE: &str = r#"{"type":"Polygon","coordinates":[[
        [-90,35],[-80,35],[-80,45],[-90,45],[-90,35]
    ]]}"#;

    #[test]
    fn parses_polygons_and_features() {
        let shape = parse_geometry(NOTCHED).expect("polygon");
        assert_eq!(shape.0.len(), 1);

        let feature =
            format!(r#"{{"type":"Feature","properties":{{}},"geometry":{NORTH_SQUARE}}}"#);
        assert_eq!(parse_geometry(&feature).expect("feature").0.len(), 1);

        let multi = r#"{"type":"MultiPolygon","coordinates":[
            [[[0,0],[1,0],[1,1],[0,0]]],
            [[[5,5],[6,5],[6,6],[5,5]]]
        ]}"#;
        assert_eq!(parse_geometry(multi).expect("multi").0.len(), 2);

        assert!(matches!(
            parse_geometry(r#"{"type":"Point","coordinates":[0,0]}"#),
            Err(GeometryError::Unsupported(_))
        ));
        assert!(matches!(
            parse_geometry(r#"{"type":"Polygon","coordinates":[[[0,0],[1]]]}"#),
            Err(GeometryError::Malformed(_))
        ));
    }

    #[test]
    fn lean_prefers_explicit_property() {
        assert_eq!(lean_from_properties(&serde_json::json!({"lean": -12.5})), Some(-12.5));
        assert_eq!(
            lean_from_properties(&serde_json::json!({"votes_dem": 300, "votes_rep": 100})),
            Some(50.0)
        );
        assert_eq!(
            lean_from_properties(&serde_json::json!({"votes_dem": "0", "votes_rep": "0"})),
            None
        );
        assert_eq!(lean_from_properties(&serde_json::json!({})), None);
    }

    #[tokio::test]
    async fn coastal_notch_is_excluded_by_exact_test() {
        let store = SqliteRegionStore::in_memory().await.expect("store");
        let notched = store
            .insert_geojson("Notched", "state", NOTCHED, None)
            .await
            .expect("insert");
        let north = store
            .insert_geojson("North", "metro", NORTH_SQUARE, None)
            .await
            .expect("insert");
        let store = Arc::new(store);

        // Inside the notch: within both bounding boxes, outside the notched polygon.
        let candidates = store.candidates(38.0, -85.0).await.expect("candidates");
        assert_eq!(candidates, vec![notched, north]);

        let mut index = RegionSpatialIndex::new(store);
        assert_eq!(index.regions_containing(38.0, -85.0).await.expect("lookup"), vec![north]);
        assert_eq!(
            index.regions_containing(38.0, -88.0).await.expect("lookup"),
            vec![notched, north]
        );
        assert_eq!(index.regions_containing(32.0, -88.0).await.expect("lookup"), vec![notched]);
        assert!(index.regions_containing(10.0, 10.0).await.expect("lookup").is_empty());
    }

    #[tokio::test]
    async fn bbox_only_regions_match_on_box() {
        let store = SqliteRegionStore::in_memory().await.expect("store");
        let zip = store
            .insert_bbox("62704", "zip", (-89.8, 39.7), (-89.6, 39.85))
            .await
            .expect("insert");
        let mut index = RegionSpatialIndex::new(Arc::new(store));
        assert_eq!(index.regions_containing(39.78, -89.65).await.expect("lookup"), vec![zip]);
    }

    #[tokio::test]
    async fn voting_lean_comes_from_containing_precinct() {
        let precincts = SqliteRegionStore::in_memory().await.expect("store");
        let collection = format!(
            r#"{{"type":"FeatureCollection","features":[
                {{"type":"Feature",
                  "properties":{{"name":"P-1","votes_dem":120,"votes_rep":80}},
                  "geometry":{NOTCHED}}},
                {{"type":"Feature","properties":{{"name":"broken"}},"geometry":null}}
            ]}}"#
        );
        let imported = precincts
            .import_feature_collection(&collection, "precinct")
            .await
            .expect("import");
        assert_eq!(imported, 1);
        assert_eq!(precincts.count().await.expect("count"), 1);

        let regions = SqliteRegionStore::in_memory().await.expect("store");
        let mut index =
            RegionSpatialIndex::new(Arc::new(regions)).with_precincts(Arc::new(precincts));
        assert_eq!(index.voting_lean_at(32.0, -88.0).await.expect("lean"), Some(20.0));
        assert_eq!(index.voting_lean_at(38.0, -85.0).await.expect("lean"), None);

        let empty = SqliteRegionStore::in_memory().await.expect("store");
        let mut without = RegionSpatialIndex::new(Arc::new(empty));
        assert_eq!(without.voting_lean_at(32.0, -88.0).await.expect("lean"), None);
    }

    #[tokio::test]
    async fn precinct_file_without_usable_features_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("precincts.geojson");
        std::fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"name":"P-1"},"geometry":null},
                {"type":"Feature","properties":{"name":"P-2"},
                 "geometry":{"type":"Point","coordinates":[0,0]}}
            ]}"#,
        )
        .expect("write");
        let err = load_precinct_index(&path).await.expect_err("nothing usable");
        assert!(err.to_string().contains("no usable precinct boundaries"), "{err}");
    }

    #[tokio::test]
    async fn precinct_file_loads_into_lean_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("precincts.geojson");
        std::fs::write(
            &path,
            format!(
                r#"{{"type":"FeatureCollection","features":[
                    {{"type":"Feature","properties":{{"name":"P-9","lean":"-7.5"}},
                      "geometry":{NORTH_SQUARE}}}
                ]}}"#
            ),
        )
        .expect("write");
        let precincts = load_precinct_index(&path).await.expect("load");
        let regions = SqliteRegionStore::in_memory().await.expect("store");
        let mut index =
            RegionSpatialIndex::new(Arc::new(regions)).with_precincts(Arc::new(precincts));
        assert_eq!(index.voting_lean_at(40.0, -85.0).await.expect("lean"), Some(-7.5));
    }

    #[tokio::test]
    async fn missing_precinct_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_precinct_index(&dir.path().join("precincts.geojson"))
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("reading precinct index"));
    }
}
