//! Rate card and local credit balance.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::billing::ExecutionRates;
use crate::error::{MeteringError, MeteringResult};

/// Prefix of per-chain gas resource types.
pub const GAS_PREFIX: &str = "GAS.";

/// Whether `unit` is a per-chain gas resource.
#[must_use]
pub fn is_gas(unit: &str) -> bool {
    unit.starts_with(GAS_PREFIX)
}

/// Parse a decimal string.
pub fn parse_decimal(value: &str) -> MeteringResult<Decimal> {
    Decimal::from_str(value).map_err(|e| MeteringError::InvalidDecimal {
        value: value.to_owned(),
        reason: e.to_string(),
    })
}

/// Units of each resource type one credit buys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateCard(BTreeMap<String, Decimal>);

impl RateCard {
    /// Build from billing rates; gas rates are keyed `GAS.<chain selector>`.
    pub fn from_rates(rates: &ExecutionRates) -> MeteringResult<Self> {
        let mut card = BTreeMap::new();
        for rate in &rates.rate_cards {
            card.insert(rate.resource_type.clone(), parse_decimal(&rate.units_per_credit)?);
        }
        for (selector, rate) in &rates.gas_tokens_per_credit {
            card.insert(format!("{GAS_PREFIX}{selector}"), parse_decimal(rate)?);
        }
        Ok(Self(card))
    }

    /// Whether no rates are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn rate(&self, unit: &str) -> MeteringResult<Decimal> {
        self.0
            .get(unit)
            .copied()
            .filter(|rate| !rate.is_zero())
            .ok_or_else(|| MeteringError::UnknownResource(unit.to_owned()))
    }
}

/// Credits available to one execution, and credits it has spent.
#[derive(Debug, Clone, Default)]
pub struct BalanceStore {
    balance: Decimal,
    spent: Decimal,
    rates: RateCard,
}

impl BalanceStore {
    /// Store with `balance` credits and `rates`.
    #[must_use]
    pub const fn new(balance: Decimal, rates: RateCard) -> Self {
        Self {
            balance,
            spent: Decimal::ZERO,
            rates,
        }
    }

    /// Available credits.
    #[must_use]
    pub const fn get(&self) -> Decimal {
        self.balance
    }

    /// Replace the available credits.
    pub fn set(&mut self, balance: Decimal) {
        self.balance = balance;
    }

    /// Credits spent so far.
    #[must_use]
    pub const fn spent(&self) -> Decimal {
        self.spent
    }

    /// Record `credits` as spent.
    pub fn add_spent(&mut self, credits: Decimal) {
        self.spent += credits;
    }

    /// Take `credits` from the balance. Fails without change if they are not there.
    pub fn minus(&mut self, credits: Decimal) -> MeteringResult<()> {
        if credits > self.balance {
            return Err(MeteringError::InsufficientBalance {
                balance: self.balance.to_string(),
                amount: credits.to_string(),
            });
        }
        self.balance -= credits;
        Ok(())
    }

    /// Add `credits`, which may be negative. Fails without change if the
    /// balance would drop below zero.
    pub fn add(&mut self, credits: Decimal) -> MeteringResult<()> {
        if credits.is_sign_negative() {
            self.minus(-credits)
        } else {
            self.balance += credits;
            Ok(())
        }
    }

    /// Credits worth `amount` units of `unit`.
    pub fn convert_to_balance(&self, unit: &str, amount: Decimal) -> MeteringResult<Decimal> {
        let rate = self.rates.rate(unit)?;
        amount
            .checked_div(rate)
            .ok_or_else(|| MeteringError::UnknownResource(unit.to_owned()))
    }

    /// Units of `unit` that `credits` buy.
    pub fn convert_from_balance(&self, unit: &str, credits: Decimal) -> MeteringResult<Decimal> {
        let rate = self.rates.rate(unit)?;
        credits
            .checked_mul(rate)
            .ok_or_else(|| MeteringError::UnknownResource(unit.to_owned()))
    }
}

/// Median of `values`; the mean of the middle two for even counts.
///
/// Returns `None` for an empty slice.
#[must_use]
pub fn median(values: &mut [Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / Decimal::TWO)
    }
}
