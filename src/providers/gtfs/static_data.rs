//! Static GTFS archive handling: fetch, CSV parsing, and construction of
//! the compact schedule bundle published to the KV store.
//!
//! The bundle uses deliberately short JSON field names; clients deserialize
//! the whole blob on every cold start and the names are part of the wire
//! contract. Field renames below are therefore load-bearing.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::error::GtfsError;

/// Bundle schema version. Bumped in lockstep with the client decoder.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum allowed download size for the GTFS zip (100 MB).
const MAX_ARCHIVE_SIZE: u64 = 100 * 1024 * 1024;
/// Maximum allowed total decompressed size for the GTFS zip (2 GB).
const MAX_DECOMPRESSED_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// --- Published bundle types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSchedule {
    #[serde(rename = "m")]
    pub meta: ScheduleMeta,
    /// pattern id -> ordered canonical station ids
    #[serde(rename = "p")]
    pub patterns: BTreeMap<String, Vec<String>>,
    #[serde(rename = "t")]
    pub trips: Vec<Trip>,
    #[serde(rename = "r")]
    pub services: ServiceRules,
    #[serde(rename = "s")]
    pub stations: BTreeMap<String, Station>,
    #[serde(rename = "f")]
    pub fares: FareTable,
    /// "origin→destination" -> trip ids serving that ordered pair
    #[serde(rename = "x")]
    pub pair_index: BTreeMap<String, Vec<String>>,
    /// Canonical station ids, north to south
    #[serde(rename = "o")]
    pub station_order: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMeta {
    /// SHA-256 of the source archive, hex
    #[serde(rename = "v")]
    pub version: String,
    /// Latest calendar end date, YYYYMMDD
    #[serde(rename = "e")]
    pub end_date: u32,
    #[serde(rename = "sv")]
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    /// Train number (trip_short_name) when present, else the raw trip id
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "s")]
    pub service_id: String,
    #[serde(rename = "p")]
    pub pattern_id: String,
    #[serde(rename = "d")]
    pub direction: u8,
    /// Interleaved [arr, dep, arr, dep, …] minutes past local midnight;
    /// values exceed 1440 for post-midnight stops
    #[serde(rename = "st")]
    pub stop_times: Vec<u32>,
    /// Route short name (fallback: route id); classification is client-side
    #[serde(rename = "rt")]
    pub route_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRules {
    #[serde(rename = "c")]
    pub calendars: BTreeMap<String, ServiceCalendar>,
    #[serde(rename = "e")]
    pub exceptions: BTreeMap<String, Vec<CalendarException>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    /// [mon, tue, wed, thu, fri, sat, sun], each 0/1
    pub days: [u8; 7],
    /// Inclusive, YYYYMMDD
    pub start: u32,
    /// Inclusive, YYYYMMDD
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarException {
    pub date: u32,
    /// 1 = service added, 2 = service removed
    #[serde(rename = "type")]
    pub exception_type: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    #[serde(rename = "n")]
    pub name: String,
    /// Fare zone id; empty when the feed provides none
    #[serde(rename = "z")]
    pub zone: String,
    /// Upstream platform stop ids aggregated into this station
    pub ids: Vec<String>,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareTable {
    pub zones: BTreeMap<String, FareZone>,
    /// "originZone→destZone" -> price in integer cents; asymmetric
    pub fares: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareZone {
    pub name: String,
}

impl StaticSchedule {
    /// Check whether a service runs on the given date. Exceptions override
    /// the weekday mask and date range; services known only through
    /// exceptions run only on their type-1 dates.
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        let day = date_to_int(date);
        if let Some(exceptions) = self.services.exceptions.get(service_id) {
            for exc in exceptions {
                if exc.date == day {
                    return exc.exception_type == 1;
                }
            }
        }
        if let Some(cal) = self.services.calendars.get(service_id) {
            if day < cal.start || day > cal.end {
                return false;
            }
            let idx = date.weekday().num_days_from_monday() as usize;
            return cal.days[idx] == 1;
        }
        false
    }
}

fn date_to_int(date: NaiveDate) -> u32 {
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

// --- Raw CSV rows ---

#[derive(Debug)]
struct RawStop {
    stop_id: String,
    stop_name: String,
    zone_id: String,
    parent_station: Option<String>,
    location_type: i32,
    lat: f64,
    lon: f64,
}

#[derive(Debug)]
struct RawRoute {
    route_short_name: Option<String>,
}

#[derive(Debug)]
struct RawTrip {
    trip_id: String,
    route_id: String,
    service_id: String,
    trip_short_name: Option<String>,
    direction: u8,
}

#[derive(Debug)]
struct RawStopTime {
    stop_sequence: i32,
    stop_id: String,
    /// Minutes past local midnight
    arrival: Option<u32>,
    departure: Option<u32>,
}

// --- Archive fetch ---

/// Download the static GTFS archive. This is the builder's single I/O
/// boundary; everything after it is a deterministic transformation.
pub async fn fetch_archive(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, GtfsError> {
    let response = client
        .get(url)
        .timeout(std::time::Duration::from_secs(120))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(GtfsError::NetworkMessage(format!(
            "GTFS archive HTTP {}",
            response.status()
        )));
    }

    if let Some(content_length) = response.content_length() {
        if content_length > MAX_ARCHIVE_SIZE {
            return Err(GtfsError::NetworkMessage(format!(
                "GTFS archive too large: {} bytes (max {} bytes)",
                content_length, MAX_ARCHIVE_SIZE
            )));
        }
    }

    let bytes = response.bytes().await?;
    if bytes.len() as u64 > MAX_ARCHIVE_SIZE {
        return Err(GtfsError::NetworkMessage(format!(
            "GTFS archive too large: {} bytes (max {} bytes)",
            bytes.len(),
            MAX_ARCHIVE_SIZE
        )));
    }
    info!(size_kb = bytes.len() / 1024, "Downloaded static GTFS archive");
    Ok(bytes.to_vec())
}

// --- Bundle construction ---

/// Build the compact schedule bundle from raw archive bytes. Deterministic:
/// the same bytes always serialize to the same JSON (maps are ordered,
/// trips keep file order, pattern ids allocate in trip order).
pub fn build_schedule(archive_bytes: &[u8]) -> Result<StaticSchedule, GtfsError> {
    let version = hex_digest(archive_bytes);
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))?;

    // ZIP bomb protection: check total uncompressed size before parsing
    let mut total_uncompressed: u64 = 0;
    for i in 0..archive.len() {
        if let Ok(entry) = archive.by_index(i) {
            total_uncompressed += entry.size();
        }
    }
    if total_uncompressed > MAX_DECOMPRESSED_SIZE {
        return Err(GtfsError::ParseError(format!(
            "GTFS zip decompressed size {} bytes exceeds limit {} bytes",
            total_uncompressed, MAX_DECOMPRESSED_SIZE
        )));
    }

    let stops = parse_stops(&mut archive)?;
    info!(count = stops.len(), "Parsed GTFS stops");

    let routes = parse_routes(&mut archive)?;
    info!(count = routes.len(), "Parsed GTFS routes");

    let raw_trips = parse_trips(&mut archive)?;
    info!(count = raw_trips.len(), "Parsed GTFS trips");

    let stop_times = parse_stop_times(&mut archive)?;
    let total_st: usize = stop_times.values().map(|v| v.len()).sum();
    info!(
        trips_with_times = stop_times.len(),
        total_stop_times = total_st,
        "Parsed GTFS stop_times"
    );

    let calendars = parse_calendar(&mut archive);
    info!(count = calendars.len(), "Parsed GTFS calendar");

    let exceptions = parse_calendar_dates(&mut archive);
    info!(services = exceptions.len(), "Parsed GTFS calendar_dates");

    let fares = parse_fare_tables(&mut archive);
    info!(
        zones = fares.zones.len(),
        pairs = fares.fares.len(),
        "Parsed GTFS fare tables"
    );

    // Canonical stations: parent rows become stations, platform children
    // attach to them. A parent with no zone inherits the first non-empty
    // child zone; a parent with zero children is dropped.
    let mut stations: BTreeMap<String, Station> = BTreeMap::new();
    for stop in stops.iter().filter(|s| s.location_type == 1) {
        stations.insert(
            stop.stop_id.clone(),
            Station {
                name: clean_station_name(&stop.stop_name),
                zone: stop.zone_id.clone(),
                ids: Vec::new(),
                lat: stop.lat,
                lon: stop.lon,
            },
        );
    }
    let mut stop_to_station: HashMap<String, String> = HashMap::new();
    for stop in stops.iter().filter(|s| s.location_type == 0) {
        let Some(parent_id) = &stop.parent_station else {
            continue;
        };
        let Some(station) = stations.get_mut(parent_id) else {
            continue;
        };
        station.ids.push(stop.stop_id.clone());
        if station.zone.is_empty() && !stop.zone_id.is_empty() {
            station.zone = stop.zone_id.clone();
        }
        stop_to_station.insert(stop.stop_id.clone(), parent_id.clone());
    }
    let before = stations.len();
    stations.retain(|_, s| !s.ids.is_empty());
    if stations.len() < before {
        warn!(
            dropped = before - stations.len(),
            "Dropped parent stations with no platform children"
        );
    }

    // Trip records and pattern deduplication, in trips.txt order.
    let mut patterns: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut pattern_by_sequence: HashMap<String, String> = HashMap::new();
    let mut trips: Vec<Trip> = Vec::new();
    for raw in &raw_trips {
        let Some(sts) = stop_times.get(&raw.trip_id) else {
            continue;
        };
        let mut trip_stops: Vec<(String, Option<u32>, Option<u32>)> = Vec::new();
        for st in sts {
            // Stops that don't map to a canonical station are dropped
            let Some(station_id) = stop_to_station.get(&st.stop_id) else {
                continue;
            };
            trip_stops.push((station_id.clone(), st.arrival, st.departure));
        }
        let timed = fill_blank_times(trip_stops);
        if timed.is_empty() {
            continue;
        }
        let mut sequence: Vec<String> = Vec::with_capacity(timed.len());
        let mut minutes: Vec<u32> = Vec::with_capacity(timed.len() * 2);
        for (station_id, arr, dep) in timed {
            sequence.push(station_id);
            minutes.push(arr);
            minutes.push(dep);
        }

        let key = sequence.join(",");
        let pattern_id = pattern_by_sequence
            .entry(key)
            .or_insert_with(|| {
                let pid = format!("p{}", patterns.len());
                patterns.insert(pid.clone(), sequence.clone());
                pid
            })
            .clone();

        trips.push(Trip {
            id: raw
                .trip_short_name
                .clone()
                .unwrap_or_else(|| raw.trip_id.clone()),
            service_id: raw.service_id.clone(),
            pattern_id,
            direction: raw.direction,
            stop_times: minutes,
            route_type: routes
                .get(&raw.route_id)
                .and_then(|r| r.route_short_name.clone())
                .unwrap_or_else(|| raw.route_id.clone()),
        });
    }
    info!(
        trips = trips.len(),
        patterns = patterns.len(),
        "Built trip records"
    );

    // Station-pair index: every ordered pair within each trip's pattern.
    let mut pair_index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for trip in &trips {
        let sequence = &patterns[&trip.pattern_id];
        for i in 0..sequence.len() {
            for j in (i + 1)..sequence.len() {
                pair_index
                    .entry(format!("{}→{}", sequence[i], sequence[j]))
                    .or_default()
                    .push(trip.id.clone());
            }
        }
    }

    // North-to-south order: latitude descending, station id as tie-break
    // to keep the output deterministic.
    let mut ordered: Vec<(&String, f64)> = stations.iter().map(|(id, s)| (id, s.lat)).collect();
    ordered.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    let station_order: Vec<String> = ordered.into_iter().map(|(id, _)| id.clone()).collect();

    let end_date = calendars.values().map(|c| c.end).max().unwrap_or(0);

    Ok(StaticSchedule {
        meta: ScheduleMeta {
            version,
            end_date,
            schema_version: SCHEMA_VERSION,
        },
        patterns,
        trips,
        services: ServiceRules {
            calendars,
            exceptions,
        },
        stations,
        fares,
        pair_index,
        station_order,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// --- Helper functions ---

/// Agency-specific cosmetic cleanup: the feed suffixes every parent stop
/// with " Caltrain Station", which riders never see spelled out.
pub fn clean_station_name(raw: &str) -> String {
    let name = raw.replace(" Caltrain Station ", " ");
    let name = name.trim();
    let name = name.strip_suffix(" Caltrain Station").unwrap_or(name);
    name.trim().to_string()
}

/// Fill blank stop times the way GTFS consumers conventionally do. A stop
/// with only one of arrival/departure gets the other copied. A stop with
/// neither (feeds commonly leave interpolated intermediate stops blank) is
/// filled linearly between the nearest timed neighbors. Untimed stops
/// before the first or after the last timed stop are dropped — the GTFS
/// reference requires times on a trip's first and last stop.
fn fill_blank_times(stops: Vec<(String, Option<u32>, Option<u32>)>) -> Vec<(String, u32, u32)> {
    let mut values: Vec<Option<(u32, u32)>> = stops
        .iter()
        .map(|(_, arrival, departure)| match (arrival, departure) {
            (Some(arr), Some(dep)) => Some((*arr, *dep)),
            (Some(arr), None) => Some((*arr, *arr)),
            (None, Some(dep)) => Some((*dep, *dep)),
            (None, None) => None,
        })
        .collect();

    let timed: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_some())
        .map(|(i, _)| i)
        .collect();
    if timed.is_empty() {
        return Vec::new();
    }

    for window in timed.windows(2) {
        let (prev, next) = (window[0], window[1]);
        if next - prev <= 1 {
            continue;
        }
        let (Some((_, from)), Some((to, _))) = (values[prev], values[next]) else {
            continue;
        };
        let span = (next - prev) as f64;
        for i in (prev + 1)..next {
            let fraction = (i - prev) as f64 / span;
            let minute =
                (from as f64 + (to as f64 - from as f64) * fraction).round() as u32;
            values[i] = Some((minute, minute));
        }
    }

    stops
        .into_iter()
        .zip(values)
        .filter_map(|((station_id, _, _), value)| value.map(|(arr, dep)| (station_id, arr, dep)))
        .collect()
}

/// Parse a GTFS time string "HH:MM:SS" to minutes past local midnight.
/// Hours >= 24 are allowed for post-midnight stops; seconds are dropped
/// (the bundle works at minute resolution).
pub fn parse_gtfs_time(time_str: &str) -> Option<u32> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u32 = parts[0].parse().ok()?;
    let minutes: u32 = parts[1].parse().ok()?;
    let _seconds: u32 = parts[2].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Parse a GTFS date string "YYYYMMDD" to its integer form, rejecting
/// non-numeric input.
fn parse_gtfs_date(s: &str) -> Option<u32> {
    if s.len() != 8 {
        return None;
    }
    s.parse().ok()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// --- CSV parsing ---

fn parse_stops<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Vec<RawStop>, GtfsError> {
    let file = archive.by_name("stops.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_id = headers
        .iter()
        .position(|h| h == "stop_id")
        .ok_or_else(|| GtfsError::ParseError("stops.txt missing stop_id".into()))?;
    let idx_name = headers.iter().position(|h| h == "stop_name");
    let idx_zone = headers.iter().position(|h| h == "zone_id");
    let idx_parent = headers.iter().position(|h| h == "parent_station");
    let idx_type = headers.iter().position(|h| h == "location_type");
    let idx_lat = headers.iter().position(|h| h == "stop_lat");
    let idx_lon = headers.iter().position(|h| h == "stop_lon");

    let mut stops = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let stop_id = record.get(idx_id).unwrap_or("").to_string();
        if stop_id.is_empty() {
            skipped += 1;
            continue;
        }
        stops.push(RawStop {
            stop_id,
            stop_name: idx_name
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .to_string(),
            zone_id: idx_zone
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .to_string(),
            parent_station: idx_parent.and_then(|i| record.get(i)).and_then(non_empty),
            location_type: idx_type
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            lat: idx_lat
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            lon: idx_lon
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped stops.txt records with empty stop_id");
    }
    Ok(stops)
}

fn parse_routes<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<HashMap<String, RawRoute>, GtfsError> {
    let file = archive.by_name("routes.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_id = headers
        .iter()
        .position(|h| h == "route_id")
        .ok_or_else(|| GtfsError::ParseError("routes.txt missing route_id".into()))?;
    let idx_short = headers.iter().position(|h| h == "route_short_name");

    let mut routes = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let route_id = record.get(idx_id).unwrap_or("").to_string();
        if route_id.is_empty() {
            skipped += 1;
            continue;
        }
        routes.insert(
            route_id,
            RawRoute {
                route_short_name: idx_short.and_then(|i| record.get(i)).and_then(non_empty),
            },
        );
    }
    if skipped > 0 {
        warn!(skipped, "Skipped routes.txt records with empty route_id");
    }
    Ok(routes)
}

fn parse_trips<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Vec<RawTrip>, GtfsError> {
    let file = archive.by_name("trips.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_trip = headers
        .iter()
        .position(|h| h == "trip_id")
        .ok_or_else(|| GtfsError::ParseError("trips.txt missing trip_id".into()))?;
    let idx_route = headers
        .iter()
        .position(|h| h == "route_id")
        .ok_or_else(|| GtfsError::ParseError("trips.txt missing route_id".into()))?;
    let idx_service = headers
        .iter()
        .position(|h| h == "service_id")
        .ok_or_else(|| GtfsError::ParseError("trips.txt missing service_id".into()))?;
    let idx_short = headers.iter().position(|h| h == "trip_short_name");
    let idx_dir = headers.iter().position(|h| h == "direction_id");

    let mut trips = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let trip_id = record.get(idx_trip).unwrap_or("").to_string();
        if trip_id.is_empty() {
            skipped += 1;
            continue;
        }
        trips.push(RawTrip {
            trip_id,
            route_id: record.get(idx_route).unwrap_or("").to_string(),
            service_id: record.get(idx_service).unwrap_or("").to_string(),
            trip_short_name: idx_short.and_then(|i| record.get(i)).and_then(non_empty),
            direction: idx_dir
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped trips.txt records with empty trip_id");
    }
    Ok(trips)
}

fn parse_stop_times<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<HashMap<String, Vec<RawStopTime>>, GtfsError> {
    let file = archive.by_name("stop_times.txt")?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers()?.clone();

    let idx_trip = headers
        .iter()
        .position(|h| h == "trip_id")
        .ok_or_else(|| GtfsError::ParseError("stop_times.txt missing trip_id".into()))?;
    let idx_seq = headers
        .iter()
        .position(|h| h == "stop_sequence")
        .ok_or_else(|| GtfsError::ParseError("stop_times.txt missing stop_sequence".into()))?;
    let idx_stop = headers
        .iter()
        .position(|h| h == "stop_id")
        .ok_or_else(|| GtfsError::ParseError("stop_times.txt missing stop_id".into()))?;
    let idx_arr = headers.iter().position(|h| h == "arrival_time");
    let idx_dep = headers.iter().position(|h| h == "departure_time");

    let mut stop_times: HashMap<String, Vec<RawStopTime>> = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let trip_id = record.get(idx_trip).unwrap_or("").to_string();
        if trip_id.is_empty() {
            skipped += 1;
            continue;
        }
        stop_times.entry(trip_id).or_default().push(RawStopTime {
            stop_sequence: record.get(idx_seq).and_then(|s| s.parse().ok()).unwrap_or(0),
            stop_id: record.get(idx_stop).unwrap_or("").to_string(),
            arrival: idx_arr.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
            departure: idx_dep.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
        });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped stop_times.txt records with empty trip_id");
    }

    for sts in stop_times.values_mut() {
        sts.sort_by_key(|st| st.stop_sequence);
    }

    Ok(stop_times)
}

fn parse_calendar<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> BTreeMap<String, ServiceCalendar> {
    let file = match archive.by_name("calendar.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No calendar.txt in GTFS zip (optional file)");
            return BTreeMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return BTreeMap::new(),
    };

    let idx_service = headers.iter().position(|h| h == "service_id");
    let day_columns = [
        "monday",
        "tuesday",
        "wednesday",
        "thursday",
        "friday",
        "saturday",
        "sunday",
    ];
    let idx_days: Vec<Option<usize>> = day_columns
        .iter()
        .map(|name| headers.iter().position(|h| h == *name))
        .collect();
    let idx_start = headers.iter().position(|h| h == "start_date");
    let idx_end = headers.iter().position(|h| h == "end_date");

    let Some(idx_service) = idx_service else {
        return BTreeMap::new();
    };

    let mut calendars = BTreeMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let service_id = record.get(idx_service).unwrap_or("").to_string();
        if service_id.is_empty() {
            skipped += 1;
            continue;
        }

        let start = idx_start.and_then(|i| record.get(i)).and_then(parse_gtfs_date);
        let end = idx_end.and_then(|i| record.get(i)).and_then(parse_gtfs_date);
        let (Some(start), Some(end)) = (start, end) else {
            skipped += 1;
            continue;
        };

        let mut days = [0u8; 7];
        for (slot, idx) in days.iter_mut().zip(&idx_days) {
            *slot = idx
                .and_then(|i| record.get(i))
                .and_then(|s| s.parse::<u8>().ok())
                .map(|v| u8::from(v == 1))
                .unwrap_or(0);
        }

        calendars.insert(service_id, ServiceCalendar { days, start, end });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped calendar.txt records (empty/unparseable)");
    }
    calendars
}

fn parse_calendar_dates<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> BTreeMap<String, Vec<CalendarException>> {
    let file = match archive.by_name("calendar_dates.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No calendar_dates.txt in GTFS zip (optional file)");
            return BTreeMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return BTreeMap::new(),
    };

    let idx_service = headers.iter().position(|h| h == "service_id");
    let idx_date = headers.iter().position(|h| h == "date");
    let idx_type = headers.iter().position(|h| h == "exception_type");

    let (Some(idx_service), Some(idx_date), Some(idx_type)) = (idx_service, idx_date, idx_type)
    else {
        return BTreeMap::new();
    };

    let mut exceptions: BTreeMap<String, Vec<CalendarException>> = BTreeMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let service_id = record.get(idx_service).unwrap_or("").to_string();
        if service_id.is_empty() {
            skipped += 1;
            continue;
        }
        let Some(date) = record.get(idx_date).and_then(parse_gtfs_date) else {
            skipped += 1;
            continue;
        };
        let exception_type = record.get(idx_type).and_then(|s| s.parse().ok()).unwrap_or(0);
        exceptions
            .entry(service_id)
            .or_default()
            .push(CalendarException {
                date,
                exception_type,
            });
    }
    if skipped > 0 {
        warn!(skipped, "Skipped calendar_dates.txt records (empty/unparseable)");
    }
    exceptions
}

/// Parse the three fare tables into the zone-keyed price lookup. All three
/// files are optional; a missing file yields an empty table.
fn parse_fare_tables<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> FareTable {
    let prices = parse_fare_attributes(archive);
    let fares = parse_fare_rules(archive, &prices);
    let zones = parse_zone_attributes(archive);
    FareTable { zones, fares }
}

/// fare_id -> price in integer cents.
fn parse_fare_attributes<R: Read + Seek>(archive: &mut zip::ZipArchive<R>) -> HashMap<String, u32> {
    let file = match archive.by_name("fare_attributes.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No fare_attributes.txt in GTFS zip (optional file)");
            return HashMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return HashMap::new(),
    };

    let idx_fare = headers.iter().position(|h| h == "fare_id");
    let idx_price = headers.iter().position(|h| h == "price");
    let (Some(idx_fare), Some(idx_price)) = (idx_fare, idx_price) else {
        return HashMap::new();
    };

    let mut prices = HashMap::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let Ok(record) = result else {
            skipped += 1;
            continue;
        };
        let fare_id = record.get(idx_fare).unwrap_or("").to_string();
        if fare_id.is_empty() {
            skipped += 1;
            continue;
        }
        let price: Option<f64> = record.get(idx_price).and_then(|s| s.parse().ok());
        let Some(price) = price.filter(|p| p.is_finite() && *p >= 0.0) else {
            skipped += 1;
            continue;
        };
        prices.insert(fare_id, (price * 100.0).round() as u32);
    }
    if skipped > 0 {
        warn!(skipped, "Skipped fare_attributes.txt records (empty/unparseable)");
    }
    prices
}

fn parse_fare_rules<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    prices: &HashMap<String, u32>,
) -> BTreeMap<String, u32> {
    let file = match archive.by_name("fare_rules.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No fare_rules.txt in GTFS zip (optional file)");
            return BTreeMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return BTreeMap::new(),
    };

    let idx_fare = headers.iter().position(|h| h == "fare_id");
    let idx_origin = headers.iter().position(|h| h == "origin_id");
    let idx_dest = headers.iter().position(|h| h == "destination_id");
    let (Some(idx_fare), Some(idx_origin), Some(idx_dest)) = (idx_fare, idx_origin, idx_dest)
    else {
        return BTreeMap::new();
    };

    let mut fares = BTreeMap::new();
    for result in rdr.records() {
        let Ok(record) = result else {
            continue;
        };
        // Only direct origin→destination rules feed the lookup
        let origin = record.get(idx_origin).unwrap_or("");
        let destination = record.get(idx_dest).unwrap_or("");
        if origin.is_empty() || destination.is_empty() {
            continue;
        }
        let Some(cents) = record.get(idx_fare).and_then(|id| prices.get(id)) else {
            continue;
        };
        fares.insert(format!("{}→{}", origin, destination), *cents);
    }
    fares
}

fn parse_zone_attributes<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> BTreeMap<String, FareZone> {
    let file = match archive.by_name("farezone_attributes.txt") {
        Ok(f) => f,
        Err(_) => {
            info!("No farezone_attributes.txt in GTFS zip (optional file)");
            return BTreeMap::new();
        }
    };
    let mut rdr = csv::Reader::from_reader(file);
    let headers = match rdr.headers() {
        Ok(h) => h.clone(),
        Err(_) => return BTreeMap::new(),
    };

    let idx_zone = headers.iter().position(|h| h == "zone_id");
    let idx_name = headers.iter().position(|h| h == "zone_name");
    let (Some(idx_zone), Some(idx_name)) = (idx_zone, idx_name) else {
        return BTreeMap::new();
    };

    let mut zones = BTreeMap::new();
    for result in rdr.records() {
        let Ok(record) = result else {
            continue;
        };
        let zone_id = record.get(idx_zone).unwrap_or("").to_string();
        if zone_id.is_empty() {
            continue;
        }
        zones.insert(
            zone_id,
            FareZone {
                name: record.get(idx_name).unwrap_or("").to_string(),
            },
        );
    }
    zones
}
