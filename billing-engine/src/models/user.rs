//! User balance account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BillingError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: i64,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(id: i64, balance: Decimal) -> Self {
        Self {
            id,
            balance,
            updated_at: Utc::now(),
        }
    }

    pub fn add_balance(&mut self, amount: Decimal) -> Result<(), BillingError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(BillingError::InvalidAmount(amount));
        }
        self.balance += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Overdraft is allowed here; pre-check is what keeps balances positive.
    pub fn deduct_balance(&mut self, amount: Decimal) -> Result<(), BillingError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(BillingError::InvalidAmount(amount));
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn negative_amounts_rejected() {
        let mut user = UserAccount::new(1, dec!(10));
        assert!(user.add_balance(dec!(-1)).is_err());
        assert!(user.deduct_balance(dec!(-1)).is_err());
        assert_eq!(user.balance, dec!(10));
    }

    #[test]
    fn balance_may_go_negative() {
        let mut user = UserAccount::new(1, dec!(1));
        user.deduct_balance(dec!(3)).unwrap();
        assert_eq!(user.balance, dec!(-2));
    }
}
