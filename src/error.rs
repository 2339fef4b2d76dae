use std::path::PathBuf;

use thiserror::Error;

use crate::fetch::Attempt;

/// Errors surfaced by the metadata, resolution and fetch layers.
#[derive(Debug, Error)]
pub enum SdmxError {
    #[error("malformed metadata in {path} at line {line}: {message}")]
    MalformedMetadata {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("metadata unavailable at {path}: {reason}")]
    MetadataUnavailable { path: PathBuf, reason: String },

    #[error("transient transport failure: {message}")]
    TransientTransport { message: String },

    #[error("dataflow {dataflow} returned no data (HTTP {status})")]
    NoDataForDataflow { dataflow: String, status: u16 },

    #[error("no dataflow returned data for {indicator} (tried: {})", tried_list(.attempts))]
    ExhaustedFallback {
        indicator: String,
        attempts: Vec<Attempt>,
    },

    #[error("invalid indicator code: {0:?}")]
    InvalidIndicatorCode(String),

    #[error("invalid dataflow id: {0:?}")]
    InvalidDataflowId(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SdmxError {
    pub fn is_metadata_unavailable(&self) -> bool {
        matches!(self, SdmxError::MetadataUnavailable { .. })
    }
}

fn tried_list(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| a.dataflow.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
