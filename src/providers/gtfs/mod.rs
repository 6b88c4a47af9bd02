//! GTFS data provider.
//!
//! Downloads the agency's static GTFS archive and builds the compact
//! schedule bundle, decodes the three GTFS-RT protobuf feeds (trip updates,
//! vehicle positions, service alerts), and merges them into one per-trip
//! realtime view. Everything past the fetch boundary is a pure
//! transformation.

pub mod error;
pub mod realtime;
pub mod static_data;
pub mod validate;
