use thiserror::Error;

use crate::identifier::{Identifier, IdentifierParseError};

/// Opaque error passed through verbatim from the radio-stack collaborator.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    code: i64,
    message: String,
}

impl TransportError {
    /// Creates a transport error from a platform code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns the platform-specific error code.
    #[must_use]
    pub fn code(&self) -> i64 {
        self.code
    }

    /// Returns the platform-supplied message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by GATT operations on proxies.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum GattError {
    /// The proxy has no live transport handle; its peripheral is not connected.
    #[error("`{identifier}` is unreachable: its peripheral is not connected")]
    Unreachable { identifier: Identifier },
    /// No element of the responder chain could service the request.
    #[error("no responder could handle `{request}`")]
    Unhandled { request: &'static str },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode value: {reason}")]
    EncodingFailed { reason: String },
    #[error("failed to decode value: {reason}")]
    DecodingFailed { reason: String },
    /// A read-only or write-only codec was asked for the unsupported direction.
    #[error("value transform does not implement {direction}")]
    TransformNotImplemented { direction: &'static str },
    /// The proxy key no longer refers to a record in this manager.
    #[error("proxy does not belong to a known peripheral record")]
    UnknownEntity,
    /// The characteristic's properties forbid the requested operation.
    #[error("`{identifier}` does not permit {operation}")]
    NotPermitted {
        identifier: Identifier,
        operation: &'static str,
    },
    /// The manager's serial queue has shut down.
    #[error("central manager queue is closed")]
    QueueClosed,
}

/// Errors returned while persisting or loading restoration state.
#[derive(Debug, Error)]
pub enum RestorationError {
    #[error("failed while reading or writing restoration state")]
    Io(#[from] std::io::Error),
    #[error("restoration state is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("no project directory is available for restoration state")]
    NoProjectDirectory,
    #[error(transparent)]
    Gatt(#[from] GattError),
}

/// Errors returned by the server-role peripheral manager.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PeripheralError {
    #[error("service `{identifier}` is already published")]
    ServiceAlreadyPublished { identifier: Identifier },
    #[error("service `{identifier}` is not published")]
    ServiceNotPublished { identifier: Identifier },
    #[error("characteristic `{identifier}` has a static value but is writable")]
    CachedValueMustBeReadOnly { identifier: Identifier },
    #[error("attribute request {request} was already answered or never issued")]
    UnknownRequest { request: u64 },
    #[error("already advertising")]
    AlreadyAdvertising,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Errors returned while parsing fake-transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("scan fixture is empty")]
    EmptyFixture,
    #[error("scan fixture record must have four `|`-separated fields")]
    InvalidRecordFieldCount,
    #[error("scan fixture record contains an empty field")]
    EmptyRecordField,
    #[error("scan fixture contains an invalid identifier")]
    InvalidIdentifier(#[from] IdentifierParseError),
    #[error("scan fixture contains an invalid RSSI")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("payload is not valid hex")]
    InvalidHex(#[from] hex::FromHexError),
}
