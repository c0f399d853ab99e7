use thiserror::Error;

use crate::clock::ClockError;
use crate::gateway::GatewayError;
use crate::indicators::IndicatorError;
use crate::models::ClientRequestId;

/// Errors surfaced at the engine boundary
///
/// Anything tied to one order names the symbol and client request id.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("{symbol}: intent {client_request_id} already reached a terminal state")]
    DuplicateIntent {
        symbol: String,
        client_request_id: ClientRequestId,
    },

    #[error("{symbol}: intent {client_request_id} rejected by pre-trade check: {reason}")]
    RiskRejected {
        symbol: String,
        client_request_id: ClientRequestId,
        reason: String,
    },

    /// The request may have reached the exchange; reconcile before retrying
    #[error("{symbol}: submission of {client_request_id} failed with unknown outcome: {source}")]
    SubmissionFailed {
        symbol: String,
        client_request_id: ClientRequestId,
        source: GatewayError,
    },

    #[error("{symbol}: order {client_request_id} failed: {source}")]
    Order {
        symbol: String,
        client_request_id: ClientRequestId,
        source: GatewayError,
    },

    #[error("{symbol}: {client_request_id} refused, an earlier ambiguous failure must be reconciled first")]
    ReconciliationRequired {
        symbol: String,
        client_request_id: ClientRequestId,
    },

    #[error("unknown order {client_request_id}")]
    UnknownOrder { client_request_id: ClientRequestId },

    #[error("{symbol}: invalid intent {client_request_id}: {reason}")]
    InvalidIntent {
        symbol: String,
        client_request_id: ClientRequestId,
        reason: String,
    },

    #[error(transparent)]
    Exchange(#[from] GatewayError),

    #[error(transparent)]
    Indicator(#[from] IndicatorError),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

impl EngineError {
    /// Errors whose order may still exist on the exchange
    pub fn outcome_unknown(&self) -> bool {
        match self {
            EngineError::SubmissionFailed { .. } => true,
            EngineError::Order { source, .. } | EngineError::Exchange(source) => {
                source.outcome_unknown()
            }
            _ => false,
        }
    }
}
