//! Error types for the billing engine.

use crate::models::{BillingStage, PreCheckReason};
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;

/// Errors surfaced by the collaborator stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        Self::Conflict {
            entity,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Usage log not found for request {0}")]
    UsageLogNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Invalid stage transition from {from} to {to}")]
    InvalidTransition { from: BillingStage, to: BillingStage },

    #[error("No request pricing configured for model {0}")]
    MissingRequestPricing(String),

    #[error("Request {0} has not been billed")]
    NotBilled(String),

    #[error("Ledger write failed (balance rolled back: {rolled_back}): {source}")]
    LedgerWriteFailed {
        rolled_back: bool,
        #[source]
        source: StoreError,
    },

    #[error("Request {0} has an unrecorded balance change and needs manual review")]
    ManualReviewRequired(String),

    #[error("Compensation task {task_id} failed after {attempts} attempts: {last_error}")]
    CompensationExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Charge queue full")]
    QueueFull,

    #[error("Charge dispatcher stopped")]
    DispatcherStopped,
}

impl BillingError {
    /// Stable tag used for metric labels and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::UsageLogNotFound(_) => "usage_log_not_found",
            Self::UserNotFound(_) => "user_not_found",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MissingRequestPricing(_) => "missing_request_pricing",
            Self::NotBilled(_) => "not_billed",
            Self::LedgerWriteFailed { .. } => "ledger_write_failed",
            Self::ManualReviewRequired(_) => "manual_review_required",
            Self::CompensationExhausted { .. } => "compensation_exhausted",
            Self::QueueFull => "queue_full",
            Self::DispatcherStopped => "dispatcher_stopped",
        }
    }

    /// A balance change may have been applied without its ledger entry.
    /// Repeating the operation could apply it again.
    pub fn is_unrecorded_change(&self) -> bool {
        matches!(
            self,
            Self::LedgerWriteFailed {
                rolled_back: false,
                ..
            } | Self::ManualReviewRequired(_)
        )
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::UsageLogNotFound(_) | BillingError::UserNotFound(_) => {
                AppError::NotFound(anyhow::Error::new(err))
            }
            BillingError::Store(StoreError::NotFound { .. }) => {
                AppError::NotFound(anyhow::Error::new(err))
            }
            BillingError::Store(StoreError::Conflict { .. }) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            BillingError::Store(StoreError::Backend(_))
            | BillingError::LedgerWriteFailed { .. } => {
                AppError::DatabaseError(anyhow::Error::new(err))
            }
            BillingError::InvalidAmount(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::NotBilled(_) => AppError::BadRequest(anyhow::Error::new(err)),
            BillingError::ManualReviewRequired(_) => AppError::Conflict(anyhow::Error::new(err)),
            BillingError::QueueFull | BillingError::DispatcherStopped => {
                AppError::ServiceUnavailable
            }
            BillingError::MissingRequestPricing(_) | BillingError::CompensationExhausted { .. } => {
                AppError::InternalError(anyhow::Error::new(err))
            }
        }
    }
}

/// Maps a pre-check denial onto the transport error the gateway returns.
impl From<PreCheckReason> for AppError {
    fn from(reason: PreCheckReason) -> Self {
        match reason {
            PreCheckReason::InsufficientBalance => {
                AppError::PaymentRequired(reason.message().to_string())
            }
            PreCheckReason::TokensQuotaExceeded
            | PreCheckReason::RequestsQuotaExceeded
            | PreCheckReason::CostQuotaExceeded => {
                AppError::TooManyRequests(reason.message().to_string(), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precheck_denials_map_to_gateway_status() {
        let err: AppError = PreCheckReason::InsufficientBalance.into();
        assert_eq!(err.status_code().as_u16(), 402);

        let err: AppError = PreCheckReason::CostQuotaExceeded.into();
        assert_eq!(err.status_code().as_u16(), 429);
    }

    #[test]
    fn ledger_failure_is_database_error() {
        let err = BillingError::LedgerWriteFailed {
            rolled_back: true,
            source: StoreError::Backend(anyhow::anyhow!("disk full")),
        };
        assert_eq!(err.kind(), "ledger_write_failed");
        assert!(matches!(AppError::from(err), AppError::DatabaseError(_)));
    }

    #[test]
    fn only_unreversed_changes_block_retries() {
        let reversed = BillingError::LedgerWriteFailed {
            rolled_back: true,
            source: StoreError::Backend(anyhow::anyhow!("disk full")),
        };
        let stuck = BillingError::LedgerWriteFailed {
            rolled_back: false,
            source: StoreError::Backend(anyhow::anyhow!("disk full")),
        };
        assert!(!reversed.is_unrecorded_change());
        assert!(stuck.is_unrecorded_change());
        assert!(BillingError::ManualReviewRequired("req-1".into()).is_unrecorded_change());
    }
}
