//! Time-windowed model pricing entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingKind {
    Input,
    Output,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingUnit {
    Token,
    Request,
    Character,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_id: i64,
    pub kind: PricingKind,
    pub unit: PricingUnit,
    pub price_per_unit: Decimal,
    /// Markup applied on top of the unit price. Falls back to the configured default.
    pub multiplier: Option<Decimal>,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
}

impl ModelPricing {
    pub fn new(model_id: i64, kind: PricingKind, price_per_unit: Decimal) -> Self {
        let unit = match kind {
            PricingKind::Request => PricingUnit::Request,
            PricingKind::Input | PricingKind::Output => PricingUnit::Token,
        };
        Self {
            model_id,
            kind,
            unit,
            price_per_unit,
            multiplier: None,
            currency: "USD".to_string(),
            effective_from: DateTime::<Utc>::MIN_UTC,
            effective_until: None,
        }
    }

    pub fn with_multiplier(mut self, multiplier: Decimal) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn with_window(mut self, from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Self {
        self.effective_from = from;
        self.effective_until = until;
        self
    }

    /// Half-open window `[effective_from, effective_until)`.
    pub fn is_effective(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_until.map_or(true, |until| at < until)
    }

    pub fn multiplier_or(&self, default: Decimal) -> Decimal {
        self.multiplier.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn window_is_half_open() {
        let now = Utc::now();
        let pricing = ModelPricing::new(1, PricingKind::Input, dec!(0.001))
            .with_window(now, Some(now + Duration::hours(1)));

        assert!(pricing.is_effective(now));
        assert!(!pricing.is_effective(now - Duration::seconds(1)));
        assert!(!pricing.is_effective(now + Duration::hours(1)));
    }
}
