//! Core order book implementation
//!
//! Uses BTreeMap for sorted price-level storage. Prices are quantized on the
//! way in: asks round up to the next granularity step, bids round down, so a
//! bucketed price never looks more aggressive than the raw one.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::{Level, Side};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Quantization unit; `None` stores raw prices unchanged
    granularity: Option<Decimal>,
    /// Bids keyed by quantized price, ascending
    bids: BTreeMap<Decimal, Decimal>,
    /// Asks keyed by quantized price, ascending
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str, granularity: Option<Decimal>) -> Self {
        debug_assert!(granularity.map_or(true, |g| g > Decimal::ZERO));
        Self {
            symbol: symbol.to_string(),
            granularity,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply one batch of raw levels to a side.
    ///
    /// Levels mapping to the same quantized price are aggregated by summing
    /// their amounts first, so the result is independent of input order. A net
    /// amount of zero removes the level; anything else replaces it.
    pub fn apply_batch(&mut self, side: Side, levels: &[Level]) {
        let mut net: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for level in levels {
            *net.entry(self.quantize(side, level.price))
                .or_insert(Decimal::ZERO) += level.amount;
        }

        let book_side = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };

        for (price, amount) in net {
            if amount.is_zero() {
                book_side.remove(&price);
            } else {
                book_side.insert(price, amount);
            }
        }
    }

    /// Lowest resting ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Highest resting bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.last_key_value().map(|(p, _)| *p)
    }

    /// Resting amount at a quantized price, if the level exists
    pub fn amount_at(&self, side: Side, price: Decimal) -> Option<Decimal> {
        match side {
            Side::Bid => self.bids.get(&price).copied(),
            Side::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Number of stored levels on a side
    pub fn depth(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    fn quantize(&self, side: Side, price: Decimal) -> Decimal {
        match self.granularity {
            None => price,
            Some(g) => {
                let steps = price / g;
                let steps = match side {
                    Side::Ask => steps.ceil(),
                    Side::Bid => steps.floor(),
                };
                steps * g
            }
        }
    }
}
