use std::{fmt::Display, str::FromStr};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("Invalid currency '{0}'. Accepted values: 'usd', 'eur', 'gbp', 'pln', 'chf'")]
pub struct CurrencyParseError(String);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Pln,
    Chf,
}

impl Currency {
    /// URL path segment on the source site.
    pub fn slug(&self) -> &'static str {
        match self {
            Currency::Usd => "usd",
            Currency::Eur => "eur",
            Currency::Gbp => "gbp",
            Currency::Pln => "pln",
            Currency::Chf => "chf",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Pln => "PLN",
            Currency::Chf => "CHF",
        }
    }
}

impl FromStr for Currency {
    type Err = CurrencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "usd" => Ok(Currency::Usd),
            "eur" => Ok(Currency::Eur),
            "gbp" => Ok(Currency::Gbp),
            "pln" => Ok(Currency::Pln),
            "chf" => Ok(Currency::Chf),
            _ => Err(CurrencyParseError(s.to_string())),
        }
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One bank's quoted rates for one currency, as seen during one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    pub bank: String,
    pub currency: Currency,
    pub cash_buy: Option<Decimal>,
    pub cash_sell: Option<Decimal>,
    pub card_buy: Option<Decimal>,
    pub card_sell: Option<Decimal>,
    pub observed_at: NaiveDateTime,
}

impl RateRecord {
    /// A quote where the bank buys above its own sell price is bogus
    /// and must not reach a persisted snapshot.
    pub fn is_valid(&self) -> bool {
        let ordered = |buy: &Option<Decimal>, sell: &Option<Decimal>| match (buy, sell) {
            (Some(b), Some(s)) => b <= s,
            _ => true,
        };
        ordered(&self.cash_buy, &self.cash_sell) && ordered(&self.card_buy, &self.card_sell)
    }
}

impl Display for RateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = |v: &Option<Decimal>| match v {
            Some(d) => d.to_string(),
            None => "—".to_string(),
        };
        write!(
            f,
            "{} [{}] cash {}/{} card {}/{}",
            self.bank,
            self.currency,
            side(&self.cash_buy),
            side(&self.cash_sell),
            side(&self.card_buy),
            side(&self.card_sell),
        )
    }
}

/// One cycle's complete, merged set of rate records. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cycle_at: NaiveDateTime,
    pub records: Vec<RateRecord>,
}

impl Snapshot {
    pub fn for_currency(&self, currency: Currency) -> impl Iterator<Item = &RateRecord> {
        self.records.iter().filter(move |r| r.currency == currency)
    }

    /// Timestamp prefix used for persisted snapshot file names.
    pub fn stamp(&self) -> String {
        self.cycle_at.format("%Y%m%d_%H%M%S").to_string()
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Snapshot at {} — {} record(s)",
            self.cycle_at.format("%Y-%m-%d %H:%M:%S"),
            self.records.len()
        )?;
        for (i, record) in self.records.iter().enumerate() {
            writeln!(f, "{:>3}. {}", i + 1, record)?;
        }
        Ok(())
    }
}
