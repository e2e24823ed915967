//! Error types for the metering device core

use std::time::Duration;

use thiserror::Error;

use crate::message::ResponseKind;

/// Failures reported by a [`Transport`](crate::Transport) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0} has not been discovered")]
    UnknownDevice(String),

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("characteristic {0} was not discovered on the device")]
    CharacteristicNotFound(String),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("{0}")]
    Platform(String),
}

/// Protocol mismatches detected while encoding or decoding frames. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("OBIS code must be exactly 6 bytes, got {0}")]
    InvalidObisCode(usize),

    #[error("OBIS code {0:?} is not in A-B:C.D.E*F notation")]
    MalformedObisCode(String),

    #[error("{kind:?} response needs {needed} bytes, frame has {actual}")]
    TruncatedFrame {
        kind: ResponseKind,
        needed: usize,
        actual: usize,
    },

    #[error("unknown response kind {0:?}")]
    UnknownResponseKind(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("service discovery on {device_id} failed: {source}")]
pub struct DiscoveryError {
    pub device_id: String,
    #[source]
    pub source: TransportError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("failed to connect to {device_id}: {source}")]
    Connect {
        device_id: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// A single standard characteristic could not be read or decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicReadError {
    #[error("reading {characteristic} failed: {source}")]
    Transport {
        characteristic: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("{characteristic} value {value} is malformed")]
    Malformed {
        characteristic: &'static str,
        value: String,
    },
}

impl CharacteristicReadError {
    pub fn characteristic(&self) -> &'static str {
        match self {
            Self::Transport { characteristic, .. } | Self::Malformed { characteristic, .. } => {
                characteristic
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("connection to {device_id} is stale")]
    StaleConnection { device_id: String },

    #[error("no response from the device within {waited:?}")]
    NoResponse { waited: Duration },

    #[error(transparent)]
    Read(#[from] CharacteristicReadError),

    #[error("failed to write request: {0}")]
    Write(#[source] TransportError),

    #[error("failed to subscribe to notifications: {0}")]
    Subscribe(#[source] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to disconnect from {device_id}: {source}")]
pub struct DisconnectError {
    pub device_id: String,
    #[source]
    pub source: TransportError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("failed to start scanning: {0}")]
    Start(#[source] TransportError),

    #[error("scan aborted: {0}")]
    Aborted(#[source] TransportError),
}
