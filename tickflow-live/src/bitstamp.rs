//! Bitstamp exchange profile: tradable pairs, asset decimals and order minimums.

use std::str::FromStr;

use rust_decimal::Decimal;

use tickflow_core::broker::precision::DEFAULT_DIGITS;
use tickflow_core::broker::{
    BacktestBroker, BrokerSettings, DefaultFillStrategy, MinimumTradeValidator, Precision,
    TradePercentage,
};
use tickflow_core::domain::Instrument;
use tickflow_core::feed::BarFeed;

pub const SUPPORTED_PAIRS: [&str; 15] = [
    "BCH/BTC", "BCH/EUR", "BCH/USD", "BTC/EUR", "BTC/USD", "ETH/BTC", "ETH/EUR", "ETH/USD",
    "EUR/USD", "LTC/BTC", "LTC/EUR", "LTC/USD", "XRP/BTC", "XRP/EUR", "XRP/USD",
];

pub const SYMBOL_DIGITS: [(&str, u32); 7] = [
    ("EUR", 2),
    ("USD", 2),
    ("BCH", 8),
    ("BTC", 8),
    ("ETH", 18),
    ("LTC", 8),
    ("XRP", 6),
];

/// Minimum order size per asset: 0.001 BTC, or 25 of the fiat price currency.
pub const MINIMUM_TRADE_AMOUNTS: [(&str, &str); 3] = [("BTC", "0.001"), ("EUR", "25"), ("USD", "25")];

/// 0.5% of the traded notional.
pub const DEFAULT_FEE: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

pub fn supported_instruments() -> Vec<Instrument> {
    SUPPORTED_PAIRS
        .iter()
        .filter_map(|pair| Instrument::parse(pair).ok())
        .collect()
}

pub fn is_supported(instrument: &Instrument) -> bool {
    SUPPORTED_PAIRS
        .iter()
        .any(|pair| instrument.to_string() == *pair)
}

pub fn precision() -> Precision {
    SYMBOL_DIGITS
        .iter()
        .fold(Precision::new(DEFAULT_DIGITS), |precision, (symbol, digits)| {
            precision.with_digits(*symbol, *digits)
        })
}

pub fn trade_validator() -> MinimumTradeValidator {
    MINIMUM_TRADE_AMOUNTS.iter().fold(
        MinimumTradeValidator::new().with_supported(supported_instruments()),
        |validator, (symbol, amount)| match Decimal::from_str(amount) {
            Ok(amount) => validator.with_minimum(*symbol, amount),
            Err(_) => validator,
        },
    )
}

/// A backtesting broker with the exchange's rules, for paper trading.
///
/// Only limit orders are accepted, every order is good-till-canceled and short
/// sells are held to plain sell funding.
pub fn paper_trading_broker<I, S>(balances: I, feed: &BarFeed, fee: Decimal) -> BacktestBroker
where
    I: IntoIterator<Item = (S, Decimal)>,
    S: Into<String>,
{
    let settings = BrokerSettings {
        commission: Box::new(TradePercentage { percentage: fee }),
        precision: precision(),
        fill_strategy: Box::new(DefaultFillStrategy::default()),
        validator: Some(Box::new(trade_validator())),
        limit_orders_only: true,
        good_till_canceled: true,
    };
    BacktestBroker::new(balances, feed, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickflow_core::broker::TradeValidator;
    use tickflow_core::domain::OrderAction;
    use tickflow_core::CoreError;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn profile_tables() {
        assert_eq!(supported_instruments().len(), 15);
        assert!(is_supported(&Instrument::new("BTC", "USD")));
        assert!(!is_supported(&Instrument::new("DOGE", "USD")));
        assert_eq!(DEFAULT_FEE, d("0.005"));

        let precision = precision();
        assert_eq!(precision.digits("USD"), 2);
        assert_eq!(precision.digits("ETH"), 18);
        assert_eq!(precision.digits("XRP"), 6);
        assert_eq!(precision.round(d("0.123456789"), "BTC"), d("0.12345679"));
    }

    #[test]
    fn validator_applies_exchange_minimums() {
        let validator = trade_validator();
        let btc_usd = Instrument::new("BTC", "USD");

        assert!(validator
            .validate(&btc_usd, OrderAction::Buy, Some(d("30000")), d("0.001"))
            .is_ok());

        let err = validator
            .validate(&btc_usd, OrderAction::Buy, Some(d("30000")), d("0.0009"))
            .unwrap_err();
        assert!(err.to_string().contains("BTC/USD amount must be >= 0.001"));

        let err = validator
            .validate(&btc_usd, OrderAction::Sell, Some(d("10000")), d("0.002"))
            .unwrap_err();
        assert!(err.to_string().contains("USD amount must be >= 25"));

        assert!(matches!(
            validator.validate(&Instrument::new("DOGE", "USD"), OrderAction::Buy, None, d("1")),
            Err(CoreError::UnknownInstrument(_))
        ));
    }
}
