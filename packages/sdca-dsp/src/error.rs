use std::time::Duration;

use thiserror::Error;

use crate::engine::StreamState;

#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid stream state transition: {from} -> {to}")]
    InvalidStateTransition { from: StreamState, to: StreamState },

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Buffer overflow: {required} bytes required")]
    BufferOverflow { required: usize },

    #[error("Downstream device request failed: {0}")]
    DeviceRequest(String),

    #[error("Downstream device request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream hardware is not prepared")]
    NotPrepared,

    #[error("No buffered data available")]
    NoData,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DspError>;
