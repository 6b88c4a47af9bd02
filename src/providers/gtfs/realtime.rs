//! GTFS-RT feed decoding and the three-feed merge into one per-trip view.
//!
//! The merge is deliberately conservative: a zero delay in the upstream
//! feed is ambiguous ("on time" vs "absent"), so zeros are treated as no
//! signal and presentation is left to clients.

use std::collections::{BTreeMap, HashMap};

use gtfs_realtime::{FeedMessage, TranslatedString};
use prost::Message;
use serde::{Deserialize, Serialize};

use super::error::GtfsError;

/// Maximum allowed protobuf response size (50 MB)
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

/// Progress state for a trip with no vehicle-level signal.
/// 0 = incoming at stop, 1 = stopped at stop, 2 = in transit.
const PROGRESS_IN_TRANSIT: u8 = 2;

// --- Published realtime types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeStatus {
    /// Max of the three source feed header timestamps, epoch seconds
    #[serde(rename = "t")]
    pub timestamp: u64,
    #[serde(rename = "byTrip")]
    pub by_trip: BTreeMap<String, TripStatus>,
    #[serde(rename = "a")]
    pub alerts: Vec<ServiceAlert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripStatus {
    /// Delay in seconds; negative means early. Absent when the feed gave
    /// no non-zero signal.
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub delay: Option<i32>,
    /// Predicted event time, epoch seconds
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub predicted_time: Option<i64>,
    /// Next/current stop id
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(rename = "st")]
    pub progress: u8,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub position: Option<VehiclePos>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePos {
    #[serde(rename = "la")]
    pub lat: f64,
    #[serde(rename = "lo")]
    pub lon: f64,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(rename = "sp", skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAlert {
    #[serde(rename = "h")]
    pub header: String,
    #[serde(rename = "d")]
    pub description: String,
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(rename = "e", skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub stop_ids: Option<Vec<String>>,
    #[serde(rename = "tr", skip_serializing_if = "Option::is_none")]
    pub trip_ids: Option<Vec<String>>,
    #[serde(rename = "st", skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(rename = "en", skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

// --- Wire decoding ---

/// Decode one GTFS-RT `FeedMessage`. Pure; malformed input is a typed
/// error, never a partial message.
pub fn decode_feed(bytes: &[u8]) -> Result<FeedMessage, GtfsError> {
    FeedMessage::decode(bytes).map_err(GtfsError::from)
}

/// Fetch and decode a GTFS-RT feed. No per-request timeout here; the
/// caller runs all three feeds under one shared deadline.
pub async fn fetch_feed(client: &reqwest::Client, url: &str) -> Result<FeedMessage, GtfsError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(GtfsError::NetworkMessage(format!(
            "GTFS-RT HTTP {}",
            response.status()
        )));
    }

    let bytes = response.bytes().await?;
    if bytes.len() > MAX_PROTOBUF_SIZE {
        return Err(GtfsError::NetworkMessage(format!(
            "GTFS-RT response too large: {} bytes (max {} bytes)",
            bytes.len(),
            MAX_PROTOBUF_SIZE
        )));
    }

    decode_feed(&bytes)
}

// --- Merging ---

/// Merge the three decoded feeds into one per-trip status value.
/// Deterministic; field order in the output maps is not contractual.
pub fn merge_feeds(
    trip_updates: &FeedMessage,
    vehicle_positions: &FeedMessage,
    alerts: &FeedMessage,
) -> RealtimeStatus {
    let mut by_trip: BTreeMap<String, TripStatus> = BTreeMap::new();

    for entity in &trip_updates.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        let Some(trip_id) = trip_update
            .trip
            .trip_id
            .as_deref()
            .filter(|id| !id.is_empty())
        else {
            continue;
        };

        // Stop context: the first stop_time_update carrying a stop id.
        // A non-zero stop-level delay overrides it below.
        let mut stop_id: Option<String> = trip_update
            .stop_time_update
            .iter()
            .find_map(|stu| stu.stop_id.clone());

        let mut delay: Option<i32> = None;
        let mut predicted_time: Option<i64> = None;
        for stu in &trip_update.stop_time_update {
            if delay.is_none() {
                let stop_delay = stu
                    .departure
                    .as_ref()
                    .and_then(|event| event.delay)
                    .filter(|d| *d != 0)
                    .or_else(|| {
                        stu.arrival
                            .as_ref()
                            .and_then(|event| event.delay)
                            .filter(|d| *d != 0)
                    });
                if let Some(d) = stop_delay {
                    delay = Some(d);
                    if let Some(sid) = &stu.stop_id {
                        stop_id = Some(sid.clone());
                    }
                }
            }
            if predicted_time.is_none() {
                predicted_time = stu
                    .departure
                    .as_ref()
                    .and_then(|event| event.time)
                    .filter(|t| *t != 0)
                    .or_else(|| {
                        stu.arrival
                            .as_ref()
                            .and_then(|event| event.time)
                            .filter(|t| *t != 0)
                    });
            }
        }
        if delay.is_none() {
            delay = trip_update.delay.filter(|d| *d != 0);
        }

        by_trip.insert(
            trip_id.to_string(),
            TripStatus {
                delay,
                predicted_time,
                stop_id,
                progress: PROGRESS_IN_TRANSIT,
                position: None,
            },
        );
    }

    // Vehicle positions, quantized to five decimal places
    let mut positions: HashMap<String, VehiclePos> = HashMap::new();
    for entity in &vehicle_positions.entity {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        let Some(trip_id) = vehicle
            .trip
            .as_ref()
            .and_then(|t| t.trip_id.as_deref())
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        let Some(position) = &vehicle.position else {
            continue;
        };
        let lat = position.latitude as f64;
        let lon = position.longitude as f64;
        if !lat.is_finite() || !lon.is_finite() {
            continue;
        }
        positions.insert(
            trip_id.to_string(),
            VehiclePos {
                lat: quantize(lat),
                lon: quantize(lon),
                bearing: position
                    .bearing
                    .map(f64::from)
                    .filter(|b| b.is_finite() && *b != 0.0),
                speed: position
                    .speed
                    .map(f64::from)
                    .filter(|s| s.is_finite() && *s != 0.0),
            },
        );
    }

    // Join positions onto the trips that have a status record
    for (trip_id, status) in by_trip.iter_mut() {
        if let Some(position) = positions.remove(trip_id) {
            status.position = Some(position);
        }
    }

    let alerts_out = alerts
        .entity
        .iter()
        .filter_map(|entity| entity.alert.as_ref())
        .map(|alert| {
            let mut stop_ids = Vec::new();
            let mut trip_ids = Vec::new();
            for informed in &alert.informed_entity {
                if let Some(sid) = informed.stop_id.as_deref().filter(|s| !s.is_empty()) {
                    stop_ids.push(sid.to_string());
                }
                if let Some(tid) = informed
                    .trip
                    .as_ref()
                    .and_then(|t| t.trip_id.as_deref())
                    .filter(|t| !t.is_empty())
                {
                    trip_ids.push(tid.to_string());
                }
            }
            let (start, end) = alert
                .active_period
                .first()
                .map(|period| (period.start, period.end))
                .unwrap_or((None, None));

            ServiceAlert {
                header: english_text(alert.header_text.as_ref()),
                description: english_text(alert.description_text.as_ref()),
                cause: alert.cause.map(|_| alert.cause().as_str_name().to_string()),
                effect: alert
                    .effect
                    .map(|_| alert.effect().as_str_name().to_string()),
                stop_ids: (!stop_ids.is_empty()).then_some(stop_ids),
                trip_ids: (!trip_ids.is_empty()).then_some(trip_ids),
                start,
                end,
            }
        })
        .collect();

    let timestamp = [trip_updates, vehicle_positions, alerts]
        .iter()
        .filter_map(|feed| feed.header.timestamp)
        .max()
        .unwrap_or(0);

    RealtimeStatus {
        timestamp,
        by_trip,
        alerts: alerts_out,
    }
}

/// Round to five decimal places, half away from zero.
fn quantize(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

/// English translation of a translated string; empty when there is none.
fn english_text(text: Option<&TranslatedString>) -> String {
    text.map(|ts| {
        ts.translation
            .iter()
            .find(|t| t.language.as_deref() == Some("en"))
            .map(|t| t.text.clone())
            .unwrap_or_default()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_realtime::trip_update::{StopTimeEvent, StopTimeUpdate};
    use gtfs_realtime::{
        alert::{Cause, Effect},
        translated_string::Translation,
        Alert, EntitySelector, FeedEntity, FeedHeader, TimeRange, TripDescriptor, TripUpdate,
        VehiclePosition,
    };

    fn make_feed(timestamp: Option<u64>, entities: Vec<FeedEntity>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp,
                ..Default::default()
            },
            entity: entities,
        }
    }

    fn empty_feed() -> FeedMessage {
        make_feed(None, vec![])
    }

    fn make_stu(
        stop_id: Option<&str>,
        departure: Option<StopTimeEvent>,
        arrival: Option<StopTimeEvent>,
    ) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_id: stop_id.map(|s| s.to_string()),
            departure,
            arrival,
            ..Default::default()
        }
    }

    fn delay_event(delay: i32) -> StopTimeEvent {
        StopTimeEvent {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn make_trip_update_entity(
        entity_id: &str,
        trip_id: &str,
        trip_delay: Option<i32>,
        stop_time_updates: Vec<StopTimeUpdate>,
    ) -> FeedEntity {
        FeedEntity {
            id: entity_id.to_string(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    ..Default::default()
                },
                stop_time_update: stop_time_updates,
                delay: trip_delay,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn make_vehicle_entity(entity_id: &str, trip_id: &str, lat: f32, lon: f32) -> FeedEntity {
        FeedEntity {
            id: entity_id.to_string(),
            vehicle: Some(VehiclePosition {
                trip: Some(TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    ..Default::default()
                }),
                position: Some(gtfs_realtime::Position {
                    latitude: lat,
                    longitude: lon,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let bad: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(
            decode_feed(bad),
            Err(GtfsError::ProtobufError(_))
        ));
    }

    #[test]
    fn decode_roundtrips_an_encoded_feed() {
        let feed = make_feed(Some(1_735_689_600), vec![]);
        let bytes = feed.encode_to_vec();
        let decoded = decode_feed(&bytes).unwrap();
        assert_eq!(decoded.header.timestamp, Some(1_735_689_600));
        assert!(decoded.entity.is_empty());
    }

    #[test]
    fn first_non_zero_stop_delay_wins_and_overrides_stop_context() {
        let entity = make_trip_update_entity(
            "e1",
            "T1",
            Some(120),
            vec![
                make_stu(Some("S1"), Some(delay_event(0)), None),
                make_stu(Some("S2"), Some(delay_event(600)), None),
            ],
        );
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());

        let trip = &status.by_trip["T1"];
        assert_eq!(trip.delay, Some(600));
        assert_eq!(trip.stop_id, Some("S2".to_string()));
        assert_eq!(trip.progress, 2);
    }

    #[test]
    fn zero_stop_delays_fall_back_to_trip_level_delay() {
        let entity = make_trip_update_entity(
            "e1",
            "T1",
            Some(-120),
            vec![make_stu(Some("S3"), None, Some(delay_event(0)))],
        );
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());

        let trip = &status.by_trip["T1"];
        assert_eq!(trip.delay, Some(-120));
        // Stop context stays with the first stop id
        assert_eq!(trip.stop_id, Some("S3".to_string()));
    }

    #[test]
    fn zero_is_no_signal_everywhere() {
        let entity = make_trip_update_entity(
            "e1",
            "T1",
            Some(0),
            vec![make_stu(Some("S1"), Some(delay_event(0)), Some(delay_event(0)))],
        );
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());

        let trip = &status.by_trip["T1"];
        assert_eq!(trip.delay, None);
        assert_eq!(trip.predicted_time, None);
        assert_eq!(trip.stop_id, Some("S1".to_string()));
    }

    #[test]
    fn arrival_delay_used_when_departure_has_none() {
        let entity = make_trip_update_entity(
            "e1",
            "T1",
            None,
            vec![make_stu(Some("S1"), None, Some(delay_event(300)))],
        );
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());
        assert_eq!(status.by_trip["T1"].delay, Some(300));
    }

    #[test]
    fn predicted_time_is_first_non_zero_time() {
        let stu1 = make_stu(
            Some("S1"),
            Some(StopTimeEvent {
                time: Some(0),
                ..Default::default()
            }),
            Some(StopTimeEvent {
                time: Some(1_735_689_600),
                ..Default::default()
            }),
        );
        let stu2 = make_stu(
            Some("S2"),
            Some(StopTimeEvent {
                time: Some(1_735_689_900),
                ..Default::default()
            }),
            None,
        );
        let entity = make_trip_update_entity("e1", "T1", None, vec![stu1, stu2]);
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());
        // The zero departure time is skipped; the arrival time of the same
        // stop wins before the later stop is reached
        assert_eq!(status.by_trip["T1"].predicted_time, Some(1_735_689_600));
    }

    #[test]
    fn entities_without_trip_id_are_skipped() {
        let entity = FeedEntity {
            id: "e1".to_string(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(String::new()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let status = merge_feeds(&make_feed(None, vec![entity]), &empty_feed(), &empty_feed());
        assert!(status.by_trip.is_empty());
    }

    #[test]
    fn merge_attaches_quantized_position() {
        let trip_entity = make_trip_update_entity(
            "e1",
            "T1",
            None,
            vec![
                make_stu(Some("S1"), Some(delay_event(0)), None),
                make_stu(Some("S2"), Some(delay_event(600)), None),
            ],
        );
        let vehicle_entity = make_vehicle_entity("v1", "T1", 37.123456, -122.654321);

        let status = merge_feeds(
            &make_feed(None, vec![trip_entity]),
            &make_feed(None, vec![vehicle_entity]),
            &empty_feed(),
        );

        let trip = &status.by_trip["T1"];
        assert_eq!(trip.delay, Some(600));
        assert_eq!(trip.stop_id, Some("S2".to_string()));
        assert_eq!(trip.progress, 2);
        let pos = trip.position.as_ref().unwrap();
        assert_eq!(pos.lat, 37.12346);
        assert_eq!(pos.lon, -122.65432);
        assert_eq!(pos.bearing, None);
        assert_eq!(pos.speed, None);
    }

    #[test]
    fn bearing_and_speed_only_when_truthy() {
        let mut entity = make_vehicle_entity("v1", "T1", 37.0, -122.0);
        if let Some(vehicle) = entity.vehicle.as_mut() {
            if let Some(position) = vehicle.position.as_mut() {
                position.bearing = Some(0.0);
                position.speed = Some(12.5);
            }
        }
        let trip_entity = make_trip_update_entity("e1", "T1", None, vec![]);
        let status = merge_feeds(
            &make_feed(None, vec![trip_entity]),
            &make_feed(None, vec![entity]),
            &empty_feed(),
        );

        let pos = status.by_trip["T1"].position.as_ref().unwrap();
        assert_eq!(pos.bearing, None);
        assert_eq!(pos.speed, Some(12.5));
    }

    #[test]
    fn invalid_position_numerics_are_discarded() {
        let entity = make_vehicle_entity("v1", "T1", f32::NAN, -122.0);
        let trip_entity = make_trip_update_entity("e1", "T1", None, vec![]);
        let status = merge_feeds(
            &make_feed(None, vec![trip_entity]),
            &make_feed(None, vec![entity]),
            &empty_feed(),
        );
        assert_eq!(status.by_trip["T1"].position, None);
    }

    #[test]
    fn positions_without_a_trip_status_are_dropped() {
        let vehicle_entity = make_vehicle_entity("v1", "T9", 37.0, -122.0);
        let status = merge_feeds(&empty_feed(), &make_feed(None, vec![vehicle_entity]), &empty_feed());
        assert!(status.by_trip.is_empty());
    }

    #[test]
    fn alert_fields_are_extracted() {
        let alert = Alert {
            active_period: vec![TimeRange {
                start: Some(1_735_689_000),
                end: Some(1_735_692_600),
            }],
            informed_entity: vec![
                EntitySelector {
                    stop_id: Some("S1".to_string()),
                    ..Default::default()
                },
                EntitySelector {
                    trip: Some(TripDescriptor {
                        trip_id: Some("T1".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            cause: Some(Cause::Accident as i32),
            effect: Some(Effect::Detour as i32),
            header_text: Some(TranslatedString {
                translation: vec![
                    Translation {
                        text: "Demora".to_string(),
                        language: Some("es".to_string()),
                    },
                    Translation {
                        text: "Delays".to_string(),
                        language: Some("en".to_string()),
                    },
                ],
            }),
            description_text: Some(TranslatedString {
                translation: vec![Translation {
                    text: "Expect delays near S1".to_string(),
                    language: Some("en".to_string()),
                }],
            }),
            ..Default::default()
        };
        let entity = FeedEntity {
            id: "a1".to_string(),
            alert: Some(alert),
            ..Default::default()
        };

        let status = merge_feeds(&empty_feed(), &empty_feed(), &make_feed(None, vec![entity]));
        assert_eq!(status.alerts.len(), 1);
        let out = &status.alerts[0];
        assert_eq!(out.header, "Delays");
        assert_eq!(out.description, "Expect delays near S1");
        assert_eq!(out.cause, Some("ACCIDENT".to_string()));
        assert_eq!(out.effect, Some("DETOUR".to_string()));
        assert_eq!(out.stop_ids, Some(vec!["S1".to_string()]));
        assert_eq!(out.trip_ids, Some(vec!["T1".to_string()]));
        assert_eq!(out.start, Some(1_735_689_000));
        assert_eq!(out.end, Some(1_735_692_600));
    }

    #[test]
    fn bare_alert_yields_empty_strings_and_no_optionals() {
        let entity = FeedEntity {
            id: "a1".to_string(),
            alert: Some(Alert::default()),
            ..Default::default()
        };
        let status = merge_feeds(&empty_feed(), &empty_feed(), &make_feed(None, vec![entity]));
        let out = &status.alerts[0];
        assert_eq!(out.header, "");
        assert_eq!(out.description, "");
        assert_eq!(out.cause, None);
        assert_eq!(out.effect, None);
        assert_eq!(out.stop_ids, None);
        assert_eq!(out.trip_ids, None);
        assert_eq!(out.start, None);
        assert_eq!(out.end, None);
    }

    #[test]
    fn feed_timestamp_is_max_of_the_three_headers() {
        let status = merge_feeds(
            &make_feed(Some(1_735_689_600), vec![]),
            &make_feed(Some(1_735_689_720), vec![]),
            &make_feed(None, vec![]),
        );
        assert_eq!(status.timestamp, 1_735_689_720);

        let status = merge_feeds(&empty_feed(), &empty_feed(), &empty_feed());
        assert_eq!(status.timestamp, 0);
    }

    #[test]
    fn trip_status_serializes_only_populated_fields() {
        let entity = make_trip_update_entity(
            "e1",
            "T1",
            None,
            vec![make_stu(Some("S1"), None, None)],
        );
        let status = merge_feeds(&make_feed(Some(7), vec![entity]), &empty_feed(), &empty_feed());
        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&status).unwrap()).unwrap();

        assert_eq!(value["t"], 7);
        let trip = &value["byTrip"]["T1"];
        assert_eq!(trip["s"], "S1");
        assert_eq!(trip["st"], 2);
        assert!(trip.get("d").is_none());
        assert!(trip.get("t").is_none());
        assert!(trip.get("p").is_none());
        assert_eq!(value["a"], serde_json::json!([]));
    }
}
