//! Symbol utilities.
//!
//! Symbols travel as unified `BASE/QUOTE` pairs (e.g. `"BTC/USDT"`). Storage
//! keys on the two halves separately, so every stored snapshot must carry a
//! symbol that splits cleanly.

use crate::error::TfError;

/// Separator between base and quote asset.
pub const PAIR_SEPARATOR: char = '/';

/// A borrowed `BASE/QUOTE` split of a unified symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPair<'a> {
    pub base: &'a str,
    pub quote: &'a str,
}

/// Split a unified symbol into its base and quote assets.
///
/// Fails when the separator is missing or either half is empty.
pub fn split_pair(symbol: &str) -> Result<SymbolPair<'_>, TfError> {
    match symbol.split_once(PAIR_SEPARATOR) {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
            Ok(SymbolPair { base, quote })
        }
        _ => Err(TfError::Parse(format!("symbol '{symbol}' is not a BASE/QUOTE pair"))),
    }
}

/// Join base and quote assets into a unified symbol.
#[inline]
pub fn join_pair(base: &str, quote: &str) -> String {
    format!("{base}{PAIR_SEPARATOR}{quote}")
}
