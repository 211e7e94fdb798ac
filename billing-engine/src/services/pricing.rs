//! Cost computation from model pricing entries.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::PricingConfig;
use crate::error::BillingError;
use crate::models::{ModelPricing, PricingKind, RequestKind};
use crate::stores::PricingStore;

const TOKENS_PER_PRICE_UNIT: u64 = 1000;

/// Breakdown of a computed cost.
#[derive(Debug, Clone, PartialEq)]
pub struct CostQuote {
    pub total: Decimal,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub request_cost: Decimal,
    /// No effective entries existed and configured defaults were applied.
    pub used_defaults: bool,
}

#[derive(Clone)]
pub struct PricingEngine {
    store: Arc<dyn PricingStore>,
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(store: Arc<dyn PricingStore>, config: PricingConfig) -> Self {
        Self { store, config }
    }

    pub fn currency(&self) -> &str {
        &self.config.currency
    }

    pub async fn quote(
        &self,
        model_id: i64,
        input_tokens: u64,
        output_tokens: u64,
        kind: RequestKind,
    ) -> Result<CostQuote, BillingError> {
        let entries = self.store.effective_pricing(model_id, Utc::now()).await?;

        tracing::debug!(
            model_id,
            input_tokens,
            output_tokens,
            request_kind = %kind,
            entries = entries.len(),
            "Computing cost"
        );

        compute_cost(
            &entries,
            input_tokens,
            output_tokens,
            kind,
            &self.config,
        )
        .ok_or(BillingError::MissingRequestPricing(model_id.to_string()))
    }

    pub async fn cost(
        &self,
        model_id: i64,
        input_tokens: u64,
        output_tokens: u64,
        kind: RequestKind,
    ) -> Result<Decimal, BillingError> {
        Ok(self
            .quote(model_id, input_tokens, output_tokens, kind)
            .await?
            .total)
    }
}

fn per_thousand(tokens: u64, price: Decimal, multiplier: Decimal) -> Decimal {
    Decimal::from(tokens) * price * multiplier / Decimal::from(TOKENS_PER_PRICE_UNIT)
}

/// Request-priced entries, when present, replace token metering entirely.
/// Async jobs are only ever priced per request; `None` means no such entry exists.
pub fn compute_cost(
    entries: &[ModelPricing],
    input_tokens: u64,
    output_tokens: u64,
    kind: RequestKind,
    config: &PricingConfig,
) -> Option<CostQuote> {
    let request_entries: Vec<&ModelPricing> = entries
        .iter()
        .filter(|p| p.kind == PricingKind::Request)
        .collect();

    if !request_entries.is_empty() {
        let request_cost: Decimal = request_entries
            .iter()
            .map(|p| p.price_per_unit * p.multiplier_or(config.default_multiplier))
            .sum();
        let total = request_cost.max(Decimal::ZERO);
        return Some(CostQuote {
            total,
            input_cost: Decimal::ZERO,
            output_cost: Decimal::ZERO,
            request_cost: total,
            used_defaults: false,
        });
    }

    if kind.is_async() {
        return None;
    }

    if entries.is_empty() {
        let input_cost = per_thousand(
            input_tokens,
            config.default_input_price,
            config.default_multiplier,
        );
        let output_cost = per_thousand(
            output_tokens,
            config.default_output_price,
            config.default_multiplier,
        );
        return Some(CostQuote {
            total: (input_cost + output_cost).max(Decimal::ZERO),
            input_cost,
            output_cost,
            request_cost: Decimal::ZERO,
            used_defaults: true,
        });
    }

    let mut input_cost = Decimal::ZERO;
    let mut output_cost = Decimal::ZERO;
    for entry in entries {
        let multiplier = entry.multiplier_or(config.default_multiplier);
        match entry.kind {
            PricingKind::Input => {
                input_cost += per_thousand(input_tokens, entry.price_per_unit, multiplier)
            }
            PricingKind::Output => {
                output_cost += per_thousand(output_tokens, entry.price_per_unit, multiplier)
            }
            PricingKind::Request => {}
        }
    }

    Some(CostQuote {
        total: (input_cost + output_cost).max(Decimal::ZERO),
        input_cost,
        output_cost,
        request_cost: Decimal::ZERO,
        used_defaults: false,
    })
}
