//! Balance mutation paired with its ledger entry.
//!
//! Stores are not assumed to be transactional, so the unit of work is
//! apply-then-record under a per-user lock, with a compensating reversal
//! when the ledger write fails. A failed reversal is logged and left for
//! reconciliation.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::locks::KeyedLocks;
use super::metrics;
use crate::error::BillingError;
use crate::models::{LedgerEntry, UserAccount};
use crate::stores::{LedgerStore, UserStore};

#[derive(Debug, Clone)]
pub struct PostedEntry {
    pub entry: LedgerEntry,
    pub balance_after: Decimal,
}

pub struct BalanceLedger {
    users: Arc<dyn UserStore>,
    ledger: Arc<dyn LedgerStore>,
    locks: KeyedLocks<i64>,
}

fn apply(user: &mut UserAccount, effect: Decimal) -> Result<(), BillingError> {
    if effect.is_sign_negative() {
        user.deduct_balance(-effect)
    } else {
        user.add_balance(effect)
    }
}

impl BalanceLedger {
    pub fn new(users: Arc<dyn UserStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            users,
            ledger,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ledger_store(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Apply `entry`'s balance effect to its user, then append it.
    pub async fn post(&self, entry: LedgerEntry) -> Result<PostedEntry, BillingError> {
        let effect = entry.balance_effect();
        let _guard = self.locks.lock(entry.user_id).await;

        let mut user = self
            .users
            .get(entry.user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(entry.user_id.to_string()))?;

        apply(&mut user, effect)?;
        self.users.update(&user).await?;

        if let Err(e) = self.ledger.create(&entry).await {
            warn!(
                user_id = entry.user_id,
                entry_id = %entry.id,
                entry_type = %entry.entry_type,
                error = %e,
                "Ledger write failed, reversing balance change"
            );
            let rolled_back = self.reverse(&mut user, effect).await;
            return Err(BillingError::LedgerWriteFailed {
                rolled_back,
                source: e,
            });
        }

        metrics::record_charged_amount(entry.entry_type.as_str(), &entry.currency, entry.amount);
        info!(
            user_id = entry.user_id,
            entry_id = %entry.id,
            entry_type = %entry.entry_type,
            amount = %entry.amount,
            balance = %user.balance,
            "Ledger entry posted"
        );

        Ok(PostedEntry {
            balance_after: user.balance,
            entry,
        })
    }

    async fn reverse(&self, user: &mut UserAccount, effect: Decimal) -> bool {
        let reversed = apply(user, -effect);
        let result = match reversed {
            Ok(()) => self.users.update(user).await.map_err(BillingError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                metrics::record_rollback("ok");
                true
            }
            Err(e) => {
                metrics::record_rollback("failed");
                error!(
                    user_id = user.id,
                    effect = %effect,
                    error = %e,
                    "Balance rollback failed; left for reconciliation"
                );
                false
            }
        }
    }
}
