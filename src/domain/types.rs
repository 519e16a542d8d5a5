use serde::{Deserialize, Serialize};
use std::fmt;

pub type SecurityId = u32;
pub type SubAccountId = u32;
pub type AlgoId = u32;
pub type InstrumentId = usize;
pub type OrderId = u64;

/// Market-data source, packed from an up-to-four character code (e.g. "BINA").
///
/// The default source (`DataSrc::DEFAULT`) is the venue's primary feed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DataSrc(u32);

impl DataSrc {
    pub const DEFAULT: Self = Self(0);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Packs the first four ASCII bytes of `code`; shorter codes are zero padded.
    pub fn from_code(code: &str) -> Self {
        let mut raw = 0u32;
        for (i, b) in code.bytes().take(4).enumerate() {
            raw |= (b as u32) << (8 * i);
        }
        Self(raw)
    }

    pub fn code(self) -> String {
        self.0
            .to_le_bytes()
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect()
    }
}

impl fmt::Display for DataSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "DEFAULT")
        } else {
            write!(f, "{}", self.code())
        }
    }
}

/// Key of the fan-out tables: one feed of one security.
pub type MdKey = (DataSrc, SecurityId);

/// Reference data for a tradable security. Only the fields the engine needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub id: SecurityId,
    pub symbol: String,
    pub lot_size: f64,
}

impl Security {
    pub fn new(id: SecurityId, symbol: impl Into<String>) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            lot_size: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub name: String,
}

impl User {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Size of the last print
    pub qty: f64,
    pub volume: f64,
    pub vwap: f64,
}

impl Trade {
    /// Folds one print into the running bar.
    pub fn update(&mut self, px: f64, qty: f64) {
        if self.open == 0.0 {
            self.open = px;
            self.high = px;
            self.low = px;
        }
        self.high = self.high.max(px);
        self.low = self.low.min(px);
        let notional = self.vwap * self.volume + px * qty;
        self.volume += qty;
        if self.volume > 0.0 {
            self.vwap = notional / self.volume;
        }
        self.close = px;
        self.qty = qty;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
}

/// Snapshot of one (source, security) feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub tm: i64,
    pub trade: Trade,
    pub quote: Quote,
}

impl MarketData {
    pub fn trade_changed(&self, previous: &MarketData) -> bool {
        self.trade != previous.trade
    }

    pub fn quote_changed(&self, previous: &MarketData) -> bool {
        self.quote != previous.quote
    }
}

/// What an algo asks for when placing an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub side: OrderSide,
    pub qty: f64,
    /// Ignored for market orders
    pub price: f64,
    pub order_type: OrderType,
    pub sub_account: SubAccountId,
}

impl Contract {
    pub fn limit(side: OrderSide, qty: f64, price: f64) -> Self {
        Self {
            side,
            qty,
            price,
            order_type: OrderType::Limit,
            sub_account: 0,
        }
    }

    pub fn market(side: OrderSide, qty: f64) -> Self {
        Self {
            side,
            qty,
            price: 0.0,
            order_type: OrderType::Market,
            sub_account: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub algo_id: AlgoId,
    pub instrument_id: InstrumentId,
    pub security_id: SecurityId,
    pub src: DataSrc,
    pub contract: Contract,
    pub tm: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecType {
    UnconfirmedNew,
    New,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    Rejected,
    RiskRejected,
    Expired,
    DoneForDay,
}

impl ExecType {
    /// No further fills can arrive for the order.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecType::Filled
                | ExecType::Canceled
                | ExecType::Rejected
                | ExecType::RiskRejected
                | ExecType::Expired
                | ExecType::DoneForDay
        )
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order state change reported by an execution adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub order_id: OrderId,
    pub exec_type: ExecType,
    /// Fill size for fills, zero otherwise
    pub last_shares: f64,
    pub last_px: f64,
    pub text: String,
    pub tm: i64,
}

impl Confirmation {
    pub fn new(order_id: OrderId, exec_type: ExecType) -> Self {
        Self {
            order_id,
            exec_type,
            last_shares: 0.0,
            last_px: 0.0,
            text: String::new(),
            tm: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn fill(order_id: OrderId, last_shares: f64, last_px: f64, complete: bool) -> Self {
        let exec_type = if complete {
            ExecType::Filled
        } else {
            ExecType::PartiallyFilled
        };
        Self {
            last_shares,
            last_px,
            ..Self::new(order_id, exec_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_src_code_roundtrip() {
        let src = DataSrc::from_code("BINA");
        assert_eq!(src.code(), "BINA");
        assert_eq!(src.to_string(), "BINA");
        assert_eq!(DataSrc::from_code("CT").code(), "CT");
        assert_eq!(DataSrc::DEFAULT.to_string(), "DEFAULT");
    }

    #[test]
    fn test_trade_and_quote_change_detection() {
        let md0 = MarketData::default();
        let mut md = md0;
        md.quote.bid_price = 99.5;
        assert!(md.quote_changed(&md0));
        assert!(!md.trade_changed(&md0));

        md.trade.update(100.0, 5.0);
        assert!(md.trade_changed(&md0));
        assert_eq!(md.trade.volume, 5.0);
        assert_eq!(md.trade.vwap, 100.0);
    }

    #[test]
    fn test_trade_bar_accumulates() {
        let mut trade = Trade::default();
        trade.update(10.0, 1.0);
        trade.update(12.0, 1.0);
        trade.update(9.0, 2.0);
        assert_eq!(trade.open, 10.0);
        assert_eq!(trade.high, 12.0);
        assert_eq!(trade.low, 9.0);
        assert_eq!(trade.close, 9.0);
        assert_eq!(trade.qty, 2.0);
        assert_eq!(trade.volume, 4.0);
        assert!((trade.vwap - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_exec_types() {
        assert!(ExecType::Filled.is_terminal());
        assert!(ExecType::Canceled.is_terminal());
        assert!(!ExecType::New.is_terminal());
        assert!(!ExecType::PartiallyFilled.is_terminal());
    }
}
