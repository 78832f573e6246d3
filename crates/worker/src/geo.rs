//! Geo enrichment
//!
//! H3 indexing, precision classes, lazy H3 cell geometry registration and
//! the place/admin-area containment lookups used by the presence
//! materializer.

use chrono::{DateTime, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use smartbuket_core::envelope::GeoSample;
use sqlx::PgExecutor;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Reported GPS accuracy bucketed for privacy degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionClass {
    Fine,
    Medium,
    Coarse,
    Unknown,
}

impl PrecisionClass {
    pub fn from_accuracy(accuracy_m: Option<f64>) -> Self {
        match accuracy_m {
            None => Self::Unknown,
            Some(m) if m <= 50.0 => Self::Fine,
            Some(m) if m <= 500.0 => Self::Medium,
            Some(_) => Self::Coarse,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fine => "fine",
            Self::Medium => "medium",
            Self::Coarse => "coarse",
            Self::Unknown => "unknown",
        }
    }
}

/// Geographic dimensions derived from one geo sample.
#[derive(Debug, Clone)]
pub struct GeoDims {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: Option<f64>,
    pub h3_r7: Option<CellIndex>,
    pub h3_r9: Option<CellIndex>,
    pub h3_r11: Option<CellIndex>,
    pub precision_class: PrecisionClass,
}

impl GeoDims {
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        [self.h3_r7, self.h3_r9, self.h3_r11].into_iter().flatten()
    }
}

/// Compute H3 cells at the configured resolutions. Returns `None` for
/// out-of-range coordinates.
pub fn compute_geo_dims(sample: &GeoSample, resolutions: &[u8]) -> Option<GeoDims> {
    let coord = LatLng::new(sample.lat, sample.lon).ok()?;

    let cell_at = |res: u8| -> Option<CellIndex> {
        if !resolutions.contains(&res) {
            return None;
        }
        Resolution::try_from(res).ok().map(|r| coord.to_cell(r))
    };

    Some(GeoDims {
        lat: sample.lat,
        lon: sample.lon,
        accuracy_m: sample.accuracy_m,
        h3_r7: cell_at(7),
        h3_r9: cell_at(9),
        h3_r11: cell_at(11),
        precision_class: PrecisionClass::from_accuracy(sample.accuracy_m),
    })
}

/// UTC hour floor of the event timestamp; keys all hourly tables.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(3600);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// Soft cap on the per-process set of registered cells. Clearing it only
/// costs extra idempotent inserts.
pub const H3_SEEN_SOFT_CAP: usize = 20_000;

/// Per-process memory of which H3 cells already have a geometry row.
#[derive(Debug, Default)]
pub struct H3CellCache {
    seen: Mutex<HashSet<String>>,
}

impl H3CellCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the cell has not been registered by this process
    /// yet, recording it as seen.
    pub fn mark(&self, cell: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.contains(cell) {
            return false;
        }
        if seen.len() > H3_SEEN_SOFT_CAP {
            seen.clear();
        }
        seen.insert(cell.to_string());
        true
    }
}

const INSERT_H3_CELL_SQL: &str = r#"
INSERT INTO h3_cells (h3_cell, resolution, geom, centroid, centroid_lat, centroid_lon)
VALUES (
    $1,
    $2,
    ST_SetSRID(ST_GeomFromText($3), 4326),
    ST_SetSRID(ST_MakePoint($5, $4), 4326),
    $4,
    $5
)
ON CONFLICT (h3_cell) DO NOTHING
"#;

/// Materialize the cell geometry row unless this process already did.
pub async fn ensure_h3_cell<'e, E>(
    executor: E,
    cache: &H3CellCache,
    cell: CellIndex,
) -> sqlx::Result<()>
where
    E: PgExecutor<'e>,
{
    let key = cell.to_string();
    if !cache.mark(&key) {
        return Ok(());
    }

    let centroid = LatLng::from(cell);
    sqlx::query(INSERT_H3_CELL_SQL)
        .bind(&key)
        .bind(i32::from(u8::from(cell.resolution())))
        .bind(boundary_wkt(cell))
        .bind(centroid.lat())
        .bind(centroid.lng())
        .execute(executor)
        .await?;

    Ok(())
}

/// Cell boundary as a closed WKT polygon ring, (lon lat) order.
fn boundary_wkt(cell: CellIndex) -> String {
    let mut ring: Vec<(f64, f64)> = cell
        .boundary()
        .iter()
        .map(|vertex| (vertex.lng(), vertex.lat()))
        .collect();

    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }

    let coords = ring
        .iter()
        .map(|(x, y)| format!("{x} {y}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("POLYGON(({coords}))")
}

/// First place whose geofence contains the point and whose validity window
/// covers the event timestamp.
pub async fn lookup_place_id<'e, E>(
    executor: E,
    lat: f64,
    lon: f64,
    event_ts: DateTime<Utc>,
) -> sqlx::Result<Option<String>>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        SELECT place_id
        FROM places
        WHERE ST_Contains(geofence, ST_SetSRID(ST_MakePoint($2, $1), 4326))
          AND (valid_from IS NULL OR valid_from <= $3)
          AND (valid_to IS NULL OR valid_to >= $3)
        ORDER BY place_id
        LIMIT 1
        "#,
    )
    .bind(lat)
    .bind(lon)
    .bind(event_ts)
    .fetch_optional(executor)
    .await
}

/// Administrative codes by level, first match per level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminCodes {
    pub country: Option<String>,
    pub province: Option<String>,
    pub municipality: Option<String>,
    pub sector: Option<String>,
}

impl AdminCodes {
    /// Coarse fixes drop the finer admin levels.
    pub fn degraded(mut self, precision: PrecisionClass) -> Self {
        if precision == PrecisionClass::Coarse {
            self.municipality = None;
            self.sector = None;
        }
        self
    }

    /// Non-null levels in aggregation order.
    pub fn levels(&self) -> Vec<(&'static str, &str)> {
        [
            ("country", self.country.as_deref()),
            ("province", self.province.as_deref()),
            ("municipality", self.municipality.as_deref()),
            ("sector", self.sector.as_deref()),
        ]
        .into_iter()
        .filter_map(|(level, code)| code.map(|c| (level, c)))
        .collect()
    }
}

/// All admin polygons containing the point with a covering validity window,
/// grouped by level.
pub async fn lookup_admin_codes<'e, E>(
    executor: E,
    lat: f64,
    lon: f64,
    event_ts: DateTime<Utc>,
) -> sqlx::Result<AdminCodes>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT level, code
        FROM admin_areas
        WHERE ST_Contains(geom, ST_SetSRID(ST_MakePoint($2, $1), 4326))
          AND (valid_from IS NULL OR valid_from <= $3)
          AND (valid_to IS NULL OR valid_to >= $3)
        ORDER BY id
        "#,
    )
    .bind(lat)
    .bind(lon)
    .bind(event_ts)
    .fetch_all(executor)
    .await?;

    let mut codes = AdminCodes::default();
    for (level, code) in rows {
        let slot = match level.as_str() {
            "country" => &mut codes.country,
            "province" => &mut codes.province,
            "municipality" => &mut codes.municipality,
            "sector" => &mut codes.sector,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(code);
        }
    }

    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(lat: f64, lon: f64, accuracy_m: Option<f64>) -> GeoSample {
        GeoSample {
            lat,
            lon,
            accuracy_m,
            source: None,
        }
    }

    #[test]
    fn test_precision_classes() {
        assert_eq!(PrecisionClass::from_accuracy(Some(25.0)), PrecisionClass::Fine);
        assert_eq!(PrecisionClass::from_accuracy(Some(50.0)), PrecisionClass::Fine);
        assert_eq!(
            PrecisionClass::from_accuracy(Some(300.0)),
            PrecisionClass::Medium
        );
        assert_eq!(
            PrecisionClass::from_accuracy(Some(501.0)),
            PrecisionClass::Coarse
        );
        assert_eq!(PrecisionClass::from_accuracy(None), PrecisionClass::Unknown);
    }

    #[test]
    fn test_floor_to_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 45).unwrap();
        assert_eq!(
            floor_to_hour(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );

        let exact = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(floor_to_hour(exact), exact);
    }

    #[test]
    fn test_geo_dims_at_configured_resolutions() {
        let dims = compute_geo_dims(&sample(18.4861, -69.9312, Some(25.0)), &[7, 9, 11])
            .expect("dims");

        let r7 = dims.h3_r7.expect("r7");
        let r9 = dims.h3_r9.expect("r9");
        let r11 = dims.h3_r11.expect("r11");
        assert_eq!(u8::from(r7.resolution()), 7);
        assert_eq!(u8::from(r9.resolution()), 9);
        assert_eq!(u8::from(r11.resolution()), 11);
        assert_eq!(dims.precision_class, PrecisionClass::Fine);
        assert_eq!(dims.cells().count(), 3);
    }

    #[test]
    fn test_geo_dims_respects_resolution_list() {
        let dims = compute_geo_dims(&sample(18.4861, -69.9312, None), &[9]).expect("dims");
        assert!(dims.h3_r7.is_none());
        assert!(dims.h3_r9.is_some());
        assert!(dims.h3_r11.is_none());
    }

    #[test]
    fn test_geo_dims_rejects_out_of_range_coordinates() {
        assert!(compute_geo_dims(&sample(123.0, -69.9312, None), &[9]).is_none());
    }

    #[test]
    fn test_boundary_wkt_is_closed_ring() {
        let dims = compute_geo_dims(&sample(18.4861, -69.9312, None), &[9]).expect("dims");
        let wkt = boundary_wkt(dims.h3_r9.expect("r9"));

        assert!(wkt.starts_with("POLYGON(("));
        assert!(wkt.ends_with("))"));

        let inner = &wkt["POLYGON((".len()..wkt.len() - 2];
        let points: Vec<&str> = inner.split(", ").collect();
        assert!(points.len() >= 7);
        assert_eq!(points.first(), points.last());
    }

    #[test]
    fn test_h3_cache_marks_once() {
        let cache = H3CellCache::new();
        assert!(cache.mark("8a2a1072b59ffff"));
        assert!(!cache.mark("8a2a1072b59ffff"));
        assert!(cache.mark("8a2a1072b597fff"));
    }

    #[test]
    fn test_admin_degradation_on_coarse() {
        let codes = AdminCodes {
            country: Some("DO".to_string()),
            province: Some("DO-01".to_string()),
            municipality: Some("DO-01-01".to_string()),
            sector: Some("DO-01-01-001".to_string()),
        };

        let degraded = codes.clone().degraded(PrecisionClass::Coarse);
        assert_eq!(degraded.country.as_deref(), Some("DO"));
        assert_eq!(degraded.province.as_deref(), Some("DO-01"));
        assert!(degraded.municipality.is_none());
        assert!(degraded.sector.is_none());

        let kept = codes.degraded(PrecisionClass::Medium);
        assert!(kept.municipality.is_some());
    }

    #[test]
    fn test_admin_levels_skip_nulls() {
        let codes = AdminCodes {
            country: Some("DO".to_string()),
            province: None,
            municipality: Some("DO-01-01".to_string()),
            sector: None,
        };

        let levels = codes.levels();
        assert_eq!(levels, vec![("country", "DO"), ("municipality", "DO-01-01")]);
    }
}
