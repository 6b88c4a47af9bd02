use thiserror::Error;

#[derive(Debug, Error)]
pub enum GtfsError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Network error: {0}")]
    NetworkMessage(String),
    #[error("GTFS parse error: {0}")]
    ParseError(String),
    #[error("ZIP error: {0}")]
    ZipError(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Protobuf decode error: {0}")]
    ProtobufError(#[from] prost::DecodeError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
