use form_pulse_core::ConnectionId;
use thiserror::Error;

use crate::aggregator::AggregatorError;

/// Failure while handling one decoded event. Always reported back to the
/// originating connection only; decode failures never reach a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] AggregatorError),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

impl HandlerError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandlerError::Store(_) => "store_write",
            HandlerError::UnknownConnection(_) => "unknown_connection",
        }
    }
}

/// Connection-level I/O failure. Ends the affected connection only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket receive failed: {0}")]
    Receive(#[source] axum::Error),
}
