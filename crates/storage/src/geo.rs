//! Geospatial encoding over the sorted-set score space
//!
//! A (longitude, latitude) point is quantized to 26 bits per axis,
//! interleaved into a 52-bit hash and stored as a sorted-set score (52-bit
//! integers are exact in a double). Searching a circle or box queries the
//! 9 neighbor cells at a radius-derived step and filters candidates by
//! real distance.

use bytes::Bytes;

use shoal_core::error::literals;
use shoal_core::{OpResult, OpStatus};

use crate::num::parse_double;
use crate::zset::{ScoreBound, SortedContainer};

pub const GEO_STEP_MAX: u32 = 26;

pub const LON_MIN: f64 = -180.0;
pub const LON_MAX: f64 = 180.0;
pub const LAT_MIN: f64 = -90.0;
pub const LAT_MAX: f64 = 90.0;

/// Earth radius used by the haversine distance, in meters
const EARTH_RADIUS_M: f64 = 6372797.560856;

/// Largest distance representable on the mercator projection, meters
const MERCATOR_MAX: f64 = 20037726.37;

const GEO_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Distance unit of the geo commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoUnit {
    Meters,
    Kilometers,
    Feet,
    Miles,
}

impl GeoUnit {
    pub fn parse(data: &[u8]) -> OpResult<Self> {
        match data.to_ascii_lowercase().as_slice() {
            b"m" => Ok(GeoUnit::Meters),
            b"km" => Ok(GeoUnit::Kilometers),
            b"ft" => Ok(GeoUnit::Feet),
            b"mi" => Ok(GeoUnit::Miles),
            _ => Err(OpStatus::InvalidArgument(
                literals::UNSUPPORTED_UNIT.to_string(),
            )),
        }
    }

    pub fn to_meters(&self) -> f64 {
        match self {
            GeoUnit::Meters => 1.0,
            GeoUnit::Kilometers => 1000.0,
            GeoUnit::Feet => 0.3048,
            GeoUnit::Miles => 1609.34,
        }
    }
}

/// Spread the low 32 bits of `v` into the even bit positions
fn spread_bits(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

/// Inverse of `spread_bits`
fn squash_bits(mut x: u64) -> u32 {
    x &= 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x as u32
}

/// Quantize and interleave a point at `step` bits per axis.
/// Latitude occupies the even positions, longitude the odd ones.
pub fn encode(point: GeoPoint, step: u32) -> u64 {
    let scale = (1u64 << step) as f64;
    let lat_off = (point.latitude - LAT_MIN) / (LAT_MAX - LAT_MIN);
    let lon_off = (point.longitude - LON_MIN) / (LON_MAX - LON_MIN);
    let lat_bits = ((lat_off * scale) as u64).min((1 << step) - 1) as u32;
    let lon_bits = ((lon_off * scale) as u64).min((1 << step) - 1) as u32;
    spread_bits(lat_bits) | (spread_bits(lon_bits) << 1)
}

/// Decode interleaved bits back to the center of their cell
pub fn decode(bits: u64, step: u32) -> GeoPoint {
    let lat_bits = squash_bits(bits) as u64;
    let lon_bits = squash_bits(bits >> 1) as u64;
    let scale = (1u64 << step) as f64;
    let lat_unit = (LAT_MAX - LAT_MIN) / scale;
    let lon_unit = (LON_MAX - LON_MIN) / scale;
    GeoPoint {
        latitude: LAT_MIN + (lat_bits as f64 + 0.5) * lat_unit,
        longitude: LON_MIN + (lon_bits as f64 + 0.5) * lon_unit,
    }
}

/// Score stored in the sorted set for a point
pub fn score_of(point: GeoPoint) -> f64 {
    encode(point, GEO_STEP_MAX) as f64
}

/// Point recovered from a stored score
pub fn point_of(score: f64) -> GeoPoint {
    decode(score as u64, GEO_STEP_MAX)
}

/// Whether the coordinates are inside the indexable domain
pub fn valid_point(point: GeoPoint) -> bool {
    (LON_MIN..=LON_MAX).contains(&point.longitude)
        && (LAT_MIN..=LAT_MAX).contains(&point.latitude)
}

/// 11-character base-32 geohash string; the final character is a `0`
/// placeholder since only 52 bits are real
pub fn hash_string(score: f64) -> String {
    let bits = score as u64;
    let mut out = String::with_capacity(11);
    for i in 0..11u32 {
        let idx = if (i + 1) * 5 > 52 {
            0
        } else {
            ((bits >> (52 - (i + 1) * 5)) & 0x1f) as usize
        };
        out.push(GEO_ALPHABET[idx] as char);
    }
    out
}

/// Haversine distance in meters
pub fn distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let u = ((lat2 - lat1) / 2.0).sin();
    let v = ((b.longitude - a.longitude).to_radians() / 2.0).sin();
    2.0 * EARTH_RADIUS_M * (u * u + lat1.cos() * lat2.cos() * v * v).sqrt().asin()
}

/// Search shape
#[derive(Debug, Clone, Copy)]
pub enum GeoShape {
    /// BYRADIUS with the radius in meters
    Circle { radius_m: f64 },
    /// BYBOX with full width and height in meters
    Rect { width_m: f64, height_m: f64 },
}

impl GeoShape {
    /// Radius of the bounding circle used for cell estimation
    fn bound_radius(&self) -> f64 {
        match *self {
            GeoShape::Circle { radius_m } => radius_m,
            GeoShape::Rect { width_m, height_m } => {
                ((width_m / 2.0).powi(2) + (height_m / 2.0).powi(2)).sqrt()
            }
        }
    }

    /// Distance from `center` if `point` is inside the shape
    fn admit(&self, center: GeoPoint, point: GeoPoint) -> Option<f64> {
        match *self {
            GeoShape::Circle { radius_m } => {
                let d = distance(center, point);
                (d <= radius_m).then_some(d)
            }
            GeoShape::Rect { width_m, height_m } => {
                let lon_dist = distance(
                    point,
                    GeoPoint { longitude: center.longitude, latitude: point.latitude },
                );
                let lat_dist = distance(
                    point,
                    GeoPoint { longitude: point.longitude, latitude: center.latitude },
                );
                if lon_dist > width_m / 2.0 || lat_dist > height_m / 2.0 {
                    return None;
                }
                Some(distance(center, point))
            }
        }
    }
}

/// Result ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoSort {
    Unsorted,
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoSearchHit {
    pub member: Bytes,
    pub dist_m: f64,
    pub point: GeoPoint,
    pub score: f64,
}

/// Cell step sized so a circle of `radius_m` around `lat` spans few cells
fn estimate_step(radius_m: f64, lat: f64) -> u32 {
    if radius_m == 0.0 {
        return GEO_STEP_MAX;
    }
    let mut step: i32 = 1;
    let mut range = radius_m;
    while range < MERCATOR_MAX {
        range *= 2.0;
        step += 1;
    }
    step -= 2;
    if !(-66.0..=66.0).contains(&lat) {
        step -= 1;
        if !(-80.0..=80.0).contains(&lat) {
            step -= 1;
        }
    }
    step.clamp(1, GEO_STEP_MAX as i32) as u32
}

/// The cell and its 8 compass neighbors at `step`, deduplicated
fn neighbor_cells(center: GeoPoint, step: u32) -> Vec<u64> {
    let bits = encode(center, step);
    let x = squash_bits(bits >> 1) as i64; // lon
    let y = squash_bits(bits) as i64; // lat
    let cells_per_axis = 1i64 << step;
    let mut cells = Vec::with_capacity(9);
    for dx in -1..=1i64 {
        for dy in -1..=1i64 {
            // Longitude wraps, latitude clamps
            let nx = (x + dx).rem_euclid(cells_per_axis);
            let ny = y + dy;
            if !(0..cells_per_axis).contains(&ny) {
                continue;
            }
            let cell = spread_bits(ny as u32) | (spread_bits(nx as u32) << 1);
            if !cells.contains(&cell) {
                cells.push(cell);
            }
        }
    }
    cells
}

/// Search the sorted set for members inside the shape around `center`.
///
/// `count` limits the result; with `any` the scan stops as soon as the
/// limit is reached instead of collecting and sorting everything.
pub fn search(
    zset: &SortedContainer,
    center: GeoPoint,
    shape: GeoShape,
    sort: GeoSort,
    count: Option<usize>,
    any: bool,
) -> Vec<GeoSearchHit> {
    let step = estimate_step(shape.bound_radius(), center.latitude);
    let mut hits = Vec::new();
    'cells: for cell in neighbor_cells(center, step) {
        let min = (cell << (52 - 2 * step)) as f64;
        let max = ((cell + 1) << (52 - 2 * step)) as f64;
        let lower = ScoreBound::inclusive(min);
        let upper = ScoreBound { value: max, exclusive: true };
        for (member, score) in zset.range_by_score(&lower, &upper, false, 0, None) {
            let point = point_of(score);
            if let Some(dist_m) = shape.admit(center, point) {
                hits.push(GeoSearchHit { member, dist_m, point, score });
                if any && count.is_some_and(|n| hits.len() >= n) {
                    break 'cells;
                }
            }
        }
    }
    match sort {
        GeoSort::Asc => hits.sort_by(|a, b| a.dist_m.total_cmp(&b.dist_m)),
        GeoSort::Desc => hits.sort_by(|a, b| b.dist_m.total_cmp(&a.dist_m)),
        GeoSort::Unsorted => {}
    }
    if let Some(n) = count {
        hits.truncate(n);
    }
    hits
}

/// Resolve a member of a geo set to its point
pub fn member_point(zset: &SortedContainer, member: &[u8]) -> Option<GeoPoint> {
    zset.score(member).map(point_of)
}

/// Parse a longitude/latitude argument pair
pub fn parse_lonlat(lon: &[u8], lat: &[u8]) -> OpResult<GeoPoint> {
    let longitude = parse_double(lon)
        .ok_or(OpStatus::InvalidValue(literals::FLOAT_RANGE))?;
    let latitude = parse_double(lat)
        .ok_or(OpStatus::InvalidValue(literals::FLOAT_RANGE))?;
    let point = GeoPoint { longitude, latitude };
    if !valid_point(point) {
        return Err(OpStatus::InvalidArgument(format!(
            "invalid longitude,latitude pair {longitude:.6},{latitude:.6}"
        )));
    }
    Ok(point)
}
