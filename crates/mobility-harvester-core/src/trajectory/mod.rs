//! Trip reconstruction from anonymous vehicle position reports.
//!
//! Transport feeds publish, every poll, the position of each vehicle on a
//! line as a distance along the route, but no stable vehicle identifier.
//! [`reconstruct`] stitches one `(line, direction)` batch of such reports
//! into trips, continuing the trips that were still open at the end of the
//! previous batch.
//!
//! # Algorithm
//!
//! ```text
//!   distance
//!      ▲            ●──●──●      trip B
//!      │      ●──●──●
//!      │   ●──●          ●──●    trip A (carried id) ... continued
//!      └─────────────────────────▶ time
//! ```
//!
//! 1. **Matching.** Repeatedly assign the globally cheapest compatible
//!    `(report, trip)` pair. A report is compatible with a trip when it is
//!    later than the trip's last point, at most [`MAX_IDLE_GAP_SECS`]
//!    after it, no more than [`MAX_BACKWARD_METERS`] behind it, and the
//!    implied speed is under the line's ceiling. The cost is the
//!    normalized distance gap plus the normalized time gap, doubled for
//!    trips that look parked. A report with no compatible trip opens a new
//!    one.
//! 2. **Split** (tram and bus only). A trip whose speed between two
//!    consecutive points is a z-score outlier beyond [`SPLIT_Z`] is cut
//!    there, when both halves keep [`MIN_SPLIT_POINTS`] points.
//! 3. **Merge** (tram and bus only). A trip that ends before another
//!    begins absorbs it when the hop between them is physically possible,
//!    or when the second trip lies inside the first one's regression
//!    prediction band.
//!
//! Tie-breaking is deterministic: reports are visited by timestamp, then
//! input order; trips in creation order; the first strictly cheaper pair
//! wins.

pub mod stats;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use stats::LinearFit;

/// Longest silence, in seconds, a trip can bridge.
pub const MAX_IDLE_GAP_SECS: f64 = 300.0;
/// Largest backward slip, in meters, tolerated between two points.
pub const MAX_BACKWARD_METERS: f64 = 40.0;
pub const STALE_PENALTY: f64 = 2.0;
pub const STALE_MIN_POINTS: usize = 5;
/// Net progress under which a trip of [`STALE_MIN_POINTS`] looks parked.
pub const STALE_DISPLACEMENT_METERS: f64 = 5.0;
pub const SPLIT_Z: f64 = 4.0;
pub const MIN_SPLIT_POINTS: usize = 3;
pub const MERGE_CONFIDENCE: f64 = 0.75;
/// Points of each open trip persisted for the next batch.
pub const CARRIED_TAIL_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineClass {
    Metro,
    Tram,
    Bus,
}

impl fmt::Display for LineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LineClass::Metro => "metro",
            LineClass::Tram => "tram",
            LineClass::Bus => "bus",
        })
    }
}

/// Which lines are metro or tram, and how fast each class may go (m/s).
///
/// Metro ceilings are high on purpose: metro reports skip stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedProfile {
    pub metro_lines: BTreeSet<String>,
    pub tram_lines: BTreeSet<String>,
    pub metro_ceiling: f64,
    pub tram_ceiling: f64,
    pub bus_ceiling: f64,
}

const DEFAULT_METRO_LINES: &[&str] = &["1", "2", "5", "6"];
const DEFAULT_TRAM_LINES: &[&str] = &[
    "3", "4", "7", "8", "9", "19", "25", "39", "44", "51", "55", "62", "81", "82", "92", "93",
    "97",
];

impl Default for SpeedProfile {
    fn default() -> Self {
        Self {
            metro_lines: DEFAULT_METRO_LINES.iter().map(|s| s.to_string()).collect(),
            tram_lines: DEFAULT_TRAM_LINES.iter().map(|s| s.to_string()).collect(),
            metro_ceiling: 250.0,
            tram_ceiling: 60.0,
            bus_ceiling: 80.0,
        }
    }
}

impl SpeedProfile {
    pub fn classify(&self, line: &str) -> LineClass {
        if self.metro_lines.contains(line) {
            LineClass::Metro
        } else if self.tram_lines.contains(line) {
            LineClass::Tram
        } else {
            LineClass::Bus
        }
    }

    pub fn ceiling(&self, class: LineClass) -> f64 {
        match class {
            LineClass::Metro => self.metro_ceiling,
            LineClass::Tram => self.tram_ceiling,
            LineClass::Bus => self.bus_ceiling,
        }
    }
}

/// One vehicle position on a line, as published by the feed.
///
/// Fields other than the ones below are kept verbatim in `extra` and
/// written back out with the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(alias = "lineId", deserialize_with = "string_or_number")]
    pub line: String,
    #[serde(default, alias = "directionId", deserialize_with = "string_or_number")]
    pub direction: String,
    #[serde(deserialize_with = "whole_seconds")]
    pub timestamp: i64,
    /// Meters travelled along the route.
    pub distance: f64,
    #[serde(default, alias = "uuid", skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PositionReport {
    pub fn new(line: &str, direction: &str, timestamp: i64, distance: f64) -> Self {
        Self {
            line: line.to_string(),
            direction: direction.to_string(),
            timestamp,
            distance,
            trip_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_trip(mut self, trip_id: &str) -> Self {
        self.trip_id = Some(trip_id.to_string());
        self
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or a number, got {other}"
        ))),
    }
}

fn whole_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let seconds = match &value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    seconds.ok_or_else(|| de::Error::custom(format!("invalid timestamp {value}")))
}

/// Input of one reconstruction: a single `(line, direction)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripBatch {
    pub line: String,
    pub direction: String,
    /// Tails of trips left open by the previous batch; each has a `trip_id`.
    pub carried: Vec<PositionReport>,
    /// New reports, in any order; their `trip_id` is ignored.
    pub fresh: Vec<PositionReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripPoint {
    pub report: PositionReport,
    /// True for points reloaded from the previous batch.
    pub carried: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedTrip {
    pub id: String,
    pub line: String,
    pub class: LineClass,
    pub points: Vec<TripPoint>,
}

impl ReconstructedTrip {
    pub fn last_timestamp(&self) -> Option<i64> {
        self.points.last().map(|p| p.report.timestamp)
    }
}

/// Tail of a trip that may continue in the next batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTrip {
    pub id: String,
    pub line: String,
    pub direction: String,
    pub points: Vec<PositionReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub line: String,
    pub direction: String,
    pub trips: Vec<ReconstructedTrip>,
}

impl Reconstruction {
    /// Every fresh report, tagged with its trip id, oldest first.
    pub fn labeled_reports(&self) -> Vec<PositionReport> {
        let mut out: Vec<PositionReport> = self
            .trips
            .iter()
            .flat_map(|trip| {
                trip.points
                    .iter()
                    .filter(|p| !p.carried)
                    .map(move |p| p.report.clone().with_trip(&trip.id))
            })
            .collect();
        out.sort_by_key(|r| r.timestamp);
        out
    }

    /// Trips whose last point is within [`MAX_IDLE_GAP_SECS`] of the newest
    /// point of the batch, with their last [`CARRIED_TAIL_LEN`] points.
    pub fn open_trips(&self) -> Vec<OpenTrip> {
        let Some(newest) = self.trips.iter().filter_map(|t| t.last_timestamp()).max() else {
            return Vec::new();
        };
        let horizon = newest.saturating_sub(MAX_IDLE_GAP_SECS as i64);
        self.trips
            .iter()
            .filter(|t| t.last_timestamp().is_some_and(|ts| ts >= horizon))
            .map(|trip| {
                let skip = trip.points.len().saturating_sub(CARRIED_TAIL_LEN);
                OpenTrip {
                    id: trip.id.clone(),
                    line: self.line.clone(),
                    direction: self.direction.clone(),
                    points: trip.points[skip..]
                        .iter()
                        .map(|p| p.report.clone().with_trip(&trip.id))
                        .collect(),
                }
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reconstruction
// ═══════════════════════════════════════════════════════════════════════

/// Seconds from `from` to `to`. Feed timestamps are arbitrary integers,
/// so the difference saturates instead of overflowing.
fn seconds_between(from: i64, to: i64) -> f64 {
    to.saturating_sub(from) as f64
}

/// A report placed in the batch arena.
#[derive(Debug, Clone, Copy)]
struct Point {
    t: i64,
    d: f64,
    /// Index into the arena of reports.
    idx: usize,
}

#[derive(Debug)]
struct Trip {
    id: String,
    points: Vec<Point>,
}

impl Trip {
    fn open(point: Point) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            points: vec![point],
        }
    }

    fn first(&self) -> Point {
        self.points[0]
    }

    fn last(&self) -> Point {
        self.points[self.points.len() - 1]
    }

    fn is_stale(&self) -> bool {
        self.points.len() >= STALE_MIN_POINTS
            && self.last().d - self.first().d < STALE_DISPLACEMENT_METERS
    }
}

/// Min/span of the batch, used to put time and distance gaps on one scale.
struct Scale {
    t_span: f64,
    d_span: f64,
}

impl Scale {
    fn of(points: &[Point]) -> Self {
        let (mut t_min, mut t_max) = (i64::MAX, i64::MIN);
        let (mut d_min, mut d_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for p in points {
            t_min = t_min.min(p.t);
            t_max = t_max.max(p.t);
            d_min = d_min.min(p.d);
            d_max = d_max.max(p.d);
        }
        Self {
            t_span: (t_max.saturating_sub(t_min)) as f64,
            d_span: d_max - d_min,
        }
    }

    fn time(&self, dt: f64) -> f64 {
        if self.t_span > 0.0 {
            dt / self.t_span
        } else {
            0.0
        }
    }

    fn distance(&self, dd: f64) -> f64 {
        if self.d_span > 0.0 && self.d_span.is_finite() {
            dd / self.d_span
        } else {
            0.0
        }
    }
}

struct Reconstructor {
    ceiling: f64,
    scale: Scale,
}

impl Reconstructor {
    fn compatible(&self, point: &Point, trip: &Trip) -> bool {
        let last = trip.last();
        let dt = seconds_between(last.t, point.t);
        let dd = point.d - last.d;
        dt > 0.0 && dt <= MAX_IDLE_GAP_SECS && dd >= -MAX_BACKWARD_METERS && dd / dt <= self.ceiling
    }

    fn score(&self, point: &Point, trip: &Trip) -> f64 {
        let last = trip.last();
        let score = self.scale.distance((point.d - last.d).abs())
            + self.scale.time(seconds_between(last.t, point.t));
        if trip.is_stale() {
            score * STALE_PENALTY
        } else {
            score
        }
    }

    /// Greedy global-minimum assignment of `pending` (already sorted).
    ///
    /// Scores depend on each trip's last point and staleness, both of which
    /// change on every assignment, so the whole product is rescored per
    /// round.
    fn assign(&self, trips: &mut Vec<Trip>, mut pending: Vec<Point>) {
        while !pending.is_empty() {
            let mut best: Option<(f64, usize, usize)> = None;
            for (pi, point) in pending.iter().enumerate() {
                for (ti, trip) in trips.iter().enumerate() {
                    if !self.compatible(point, trip) {
                        continue;
                    }
                    let score = self.score(point, trip);
                    if best.map_or(true, |(b, _, _)| score < b) {
                        best = Some((score, pi, ti));
                    }
                }
            }
            match best {
                Some((_, pi, ti)) => {
                    let point = pending.remove(pi);
                    trips[ti].points.push(point);
                }
                None => {
                    let point = pending.remove(0);
                    trips.push(Trip::open(point));
                }
            }
        }
    }

    /// Cut trips at speed outliers. Cut-off tails get fresh ids.
    fn split(&self, trips: &mut Vec<Trip>) {
        let mut tails = Vec::new();
        for trip in trips.iter_mut() {
            let n = trip.points.len();
            if n < 2 * MIN_SPLIT_POINTS {
                continue;
            }
            let speeds: Vec<f64> = trip
                .points
                .windows(2)
                .map(|pair| {
                    let dt = seconds_between(pair[0].t, pair[1].t);
                    let speed = (pair[1].d - pair[0].d) / dt;
                    if dt > 0.0 && speed > 0.0 {
                        speed
                    } else {
                        0.0
                    }
                })
                .collect();
            let Some(z) = stats::z_scores(&speeds) else {
                continue;
            };

            let mut cuts = Vec::new();
            let mut segment_start = 0;
            for (i, score) in z.iter().enumerate() {
                let cut = i + 1;
                if score.abs() > SPLIT_Z
                    && cut - segment_start >= MIN_SPLIT_POINTS
                    && n - cut >= MIN_SPLIT_POINTS
                {
                    cuts.push(cut);
                    segment_start = cut;
                }
            }
            let mut pieces: Vec<Trip> = cuts
                .into_iter()
                .rev()
                .map(|cut| Trip {
                    id: Uuid::new_v4().to_string(),
                    points: trip.points.split_off(cut),
                })
                .collect();
            pieces.reverse();
            tails.extend(pieces);
        }
        trips.extend(tails);
    }

    fn mergeable(&self, a: &Trip, b: &Trip) -> bool {
        if a.points.len() < 2 || b.points.len() < 2 {
            return false;
        }
        let (end, start) = (a.last(), b.first());
        if end.t >= start.t {
            return false;
        }
        let dt = seconds_between(end.t, start.t);
        let dd = start.d - end.d;
        if dd < -MAX_BACKWARD_METERS {
            return false;
        }
        if dt < MAX_IDLE_GAP_SECS && dd / dt <= self.ceiling {
            return true;
        }
        self.continues_trend(a, b)
    }

    /// Every point of `b` inside the prediction band of a line fitted on `a`.
    fn continues_trend(&self, a: &Trip, b: &Trip) -> bool {
        let origin = a.first().t;
        let xs: Vec<f64> = a.points.iter().map(|p| seconds_between(origin, p.t)).collect();
        let ys: Vec<f64> = a.points.iter().map(|p| p.d).collect();
        let Some(fit) = LinearFit::fit(&xs, &ys) else {
            return false;
        };
        b.points.iter().all(|p| {
            let x = seconds_between(origin, p.t);
            (p.d - fit.predict(x)).abs() <= fit.prediction_half_width(x, MERGE_CONFIDENCE)
        })
    }

    /// Merge the closest candidate pairs, each trip taking part at most once.
    fn merge(&self, trips: &mut Vec<Trip>) {
        let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
        for (ai, a) in trips.iter().enumerate() {
            for (bi, b) in trips.iter().enumerate() {
                if ai != bi && self.mergeable(a, b) {
                    candidates.push(((b.first().d - a.last().d).abs(), ai, bi));
                }
            }
        }

        let mut merges = Vec::new();
        while let Some(best) = candidates
            .iter()
            .copied()
            .reduce(|best, c| if c.0 < best.0 { c } else { best })
        {
            let (_, ai, bi) = best;
            merges.push((ai, bi));
            candidates.retain(|&(_, x, y)| x != ai && x != bi && y != ai && y != bi);
        }

        for (ai, bi) in merges {
            let absorbed = std::mem::take(&mut trips[bi].points);
            trips[ai].points.extend(absorbed);
        }
        trips.retain(|t| !t.points.is_empty());
    }
}

fn by_time(a: &Point, b: &Point) -> Ordering {
    a.t.cmp(&b.t).then(a.idx.cmp(&b.idx))
}

/// Reconstruct the trips of one `(line, direction)` batch.
///
/// Never panics on degenerate input: an empty batch yields no trips, and
/// zero-length time or distance spans contribute nothing to the score.
pub fn reconstruct(batch: TripBatch, profile: &SpeedProfile) -> Reconstruction {
    let class = profile.classify(&batch.line);
    let n_carried = batch.carried.len();
    let mut arena: Vec<PositionReport> = batch.carried;
    arena.extend(batch.fresh);

    let mut seen_fresh = BTreeSet::new();
    let mut points = Vec::with_capacity(arena.len());
    for (idx, report) in arena.iter().enumerate() {
        if !report.distance.is_finite() {
            continue;
        }
        // The same report polled twice is one observation.
        if idx >= n_carried && !seen_fresh.insert((report.timestamp, report.distance.to_bits())) {
            continue;
        }
        points.push(Point {
            t: report.timestamp,
            d: report.distance,
            idx,
        });
    }

    let engine = Reconstructor {
        ceiling: profile.ceiling(class),
        scale: Scale::of(&points),
    };

    let mut trips: Vec<Trip> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut pending = Vec::new();
    for point in points {
        let carried_id = (point.idx < n_carried)
            .then(|| arena[point.idx].trip_id.clone())
            .flatten();
        match carried_id {
            Some(id) => {
                let slot = *by_id.entry(id.clone()).or_insert_with(|| {
                    trips.push(Trip { id, points: vec![] });
                    trips.len() - 1
                });
                trips[slot].points.push(point);
            }
            None => pending.push(point),
        }
    }
    for trip in &mut trips {
        trip.points.sort_by(by_time);
        trip.points.dedup_by_key(|p| p.t);
    }
    pending.sort_by(by_time);

    if trips.is_empty() {
        if let Some(first) = pending.first().map(|p| p.t) {
            let seeds = pending.iter().take_while(|p| p.t == first).count();
            trips.extend(pending.drain(..seeds).map(Trip::open));
        }
    }

    engine.assign(&mut trips, pending);
    if class != LineClass::Metro {
        engine.split(&mut trips);
        engine.merge(&mut trips);
    }

    let trips = trips
        .into_iter()
        .map(|trip| ReconstructedTrip {
            line: batch.line.clone(),
            class,
            points: trip
                .points
                .iter()
                .map(|p| TripPoint {
                    report: arena[p.idx].clone(),
                    carried: p.idx < n_carried,
                })
                .collect(),
            id: trip.id,
        })
        .collect();

    Reconstruction {
        line: batch.line,
        direction: batch.direction,
        trips,
    }
}
