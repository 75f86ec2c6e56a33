// =============================================================================
// Markets argument — `Exchange1:marketA,marketB;Exchange2:marketC`
// =============================================================================

use crate::error::ConfigError;

/// One exchange and the markets to follow on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketGroup {
    pub exchange: String,
    pub markets: Vec<String>,
}

/// Parse the startup markets argument.
///
/// Whitespace is ignored anywhere in the input and exchange names are
/// title-cased (`binance` and `BINANCE` both become `Binance`). Empty groups
/// (a trailing `;`) are skipped. Market symbols are kept as given; sources
/// normalise them to their own casing.
pub fn parse_markets(input: &str) -> Result<Vec<MarketGroup>, ConfigError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let malformed = |reason: String| ConfigError::MalformedMarkets {
        input: input.to_string(),
        reason,
    };

    let mut groups: Vec<MarketGroup> = Vec::new();
    for group in compact.split(';').filter(|g| !g.is_empty()) {
        let Some((exchange, markets)) = group.split_once(':') else {
            return Err(malformed(format!("group {group:?} has no ':' separator")));
        };
        if exchange.is_empty() {
            return Err(malformed(format!("group {group:?} has no exchange name")));
        }

        let markets: Vec<String> = markets
            .split(',')
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        if markets.is_empty() {
            return Err(malformed(format!("exchange {exchange:?} lists no markets")));
        }

        let exchange = title_case(exchange);
        match groups.iter_mut().find(|g| g.exchange == exchange) {
            Some(existing) => {
                for market in markets {
                    if !existing.markets.contains(&market) {
                        existing.markets.push(market);
                    }
                }
            }
            None => groups.push(MarketGroup { exchange, markets }),
        }
    }

    if groups.is_empty() {
        return Err(malformed("no exchanges given".to_string()));
    }
    Ok(groups)
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
