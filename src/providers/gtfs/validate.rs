//! Structural and referential-integrity checks over a built schedule.
//!
//! The daily worker publishes only when the returned list is empty, so a
//! broken upstream feed keeps yesterday's bundle serving instead of
//! replacing it with bad data.

use super::static_data::StaticSchedule;

/// Minimum plausible sizes for a real commuter-rail feed. Anything below
/// these means the archive was truncated or mis-parsed.
const MIN_STATIONS: usize = 10;
const MIN_TRIPS: usize = 10;
const MIN_PATTERNS: usize = 2;

/// Returns every violated expectation, empty when the schedule is
/// publishable. `min_end_date` is YYYYMMDD; a calendar that ends before it
/// is stale.
pub fn validate(schedule: &StaticSchedule, min_end_date: u32) -> Vec<String> {
    let mut violations = Vec::new();

    if schedule.meta.version.is_empty() {
        violations.push("metadata version is empty".to_string());
    }
    if schedule.meta.end_date < min_end_date {
        violations.push(format!(
            "calendar end date {} is before minimum {}",
            schedule.meta.end_date, min_end_date
        ));
    }

    if schedule.stations.len() < MIN_STATIONS {
        violations.push(format!(
            "only {} stations (expected at least {})",
            schedule.stations.len(),
            MIN_STATIONS
        ));
    }
    if schedule.trips.len() < MIN_TRIPS {
        violations.push(format!(
            "only {} trips (expected at least {})",
            schedule.trips.len(),
            MIN_TRIPS
        ));
    }
    if schedule.patterns.len() < MIN_PATTERNS {
        violations.push(format!(
            "only {} patterns (expected at least {})",
            schedule.patterns.len(),
            MIN_PATTERNS
        ));
    }

    for (pattern_id, stations) in &schedule.patterns {
        for station_id in stations {
            if !schedule.stations.contains_key(station_id) {
                violations.push(format!(
                    "pattern {} references unknown station {}",
                    pattern_id, station_id
                ));
            }
        }
    }

    for trip in &schedule.trips {
        match schedule.patterns.get(&trip.pattern_id) {
            Some(pattern) => {
                if trip.stop_times.len() != 2 * pattern.len() {
                    violations.push(format!(
                        "trip {} has {} stop times for a {}-stop pattern",
                        trip.id,
                        trip.stop_times.len(),
                        pattern.len()
                    ));
                }
            }
            None => {
                violations.push(format!(
                    "trip {} references unknown pattern {}",
                    trip.id, trip.pattern_id
                ));
            }
        }
        let known_service = schedule.services.calendars.contains_key(&trip.service_id)
            || schedule.services.exceptions.contains_key(&trip.service_id);
        if !known_service {
            violations.push(format!(
                "trip {} references unknown service {}",
                trip.id, trip.service_id
            ));
        }
    }

    if schedule.station_order.is_empty() {
        violations.push("ordered station list is empty".to_string());
    }
    for station_id in &schedule.station_order {
        if !schedule.stations.contains_key(station_id) {
            violations.push(format!(
                "ordered station list references unknown station {}",
                station_id
            ));
        }
    }

    violations
}
