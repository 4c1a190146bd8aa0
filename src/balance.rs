// =============================================================================
// Balance-field extraction — total equity with a well-defined fallback order
// =============================================================================
//
// When a position exists, available-balance can sit far below total equity
// because margin is locked; using it as the P&L baseline produces spurious
// ±10% jumps between cycles. The engine therefore always prefers
// wallet + unrealised and only degrades through the fallback chain when a
// venue omits those fields.
// =============================================================================

use crate::exchange::{
    BalanceMap, KEY_AVAILABLE_BALANCE, KEY_BALANCE, KEY_TOTAL_UNREALIZED_PROFIT,
    KEY_TOTAL_WALLET_BALANCE,
};

/// Result of extracting "total equity" from a canonical balance map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquityExtraction {
    pub equity: f64,
    /// True only when wallet + unrealised was used.
    pub used_total_equity: bool,
    /// False when no usable field was found (equity is 0).
    pub ok: bool,
}

/// Extract account equity from `balance` with the ordered fallback:
///
/// 1. `totalWalletBalance > 0` and `totalUnrealizedProfit` present
///    → `wallet + unrealised`, flagged as total equity.
/// 2. `availableBalance > 0` → available balance.
/// 3. `balance > 0` → plain balance.
/// 4. Nothing usable → 0, extraction failed.
pub fn extract_total_equity(balance: &BalanceMap) -> EquityExtraction {
    let wallet = balance.get(KEY_TOTAL_WALLET_BALANCE).copied();
    let unrealized = balance.get(KEY_TOTAL_UNREALIZED_PROFIT).copied();

    if let (Some(w), Some(u)) = (wallet, unrealized) {
        if w > 0.0 {
            return EquityExtraction {
                equity: w + u,
                used_total_equity: true,
                ok: true,
            };
        }
    }

    if let Some(available) = balance.get(KEY_AVAILABLE_BALANCE).copied() {
        if available > 0.0 {
            return EquityExtraction {
                equity: available,
                used_total_equity: false,
                ok: true,
            };
        }
    }

    if let Some(plain) = balance.get(KEY_BALANCE).copied() {
        if plain > 0.0 {
            return EquityExtraction {
                equity: plain,
                used_total_equity: false,
                ok: true,
            };
        }
    }

    EquityExtraction {
        equity: 0.0,
        used_total_equity: false,
        ok: false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, f64)]) -> BalanceMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn prefers_wallet_plus_unrealized() {
        let b = map(&[
            (KEY_TOTAL_WALLET_BALANCE, 1000.0),
            (KEY_TOTAL_UNREALIZED_PROFIT, -50.0),
            (KEY_AVAILABLE_BALANCE, 400.0),
            (KEY_BALANCE, 999.0),
        ]);
        let e = extract_total_equity(&b);
        assert!(e.ok);
        assert!(e.used_total_equity);
        assert_eq!(e.equity, 950.0);
    }

    #[test]
    fn wallet_requires_unrealized_present() {
        // Wallet alone is not enough: without the unrealised field the sum
        // would silently ignore open-position P&L.
        let b = map(&[
            (KEY_TOTAL_WALLET_BALANCE, 1000.0),
            (KEY_AVAILABLE_BALANCE, 400.0),
        ]);
        let e = extract_total_equity(&b);
        assert!(e.ok);
        assert!(!e.used_total_equity);
        assert_eq!(e.equity, 400.0);
    }

    #[test]
    fn zero_wallet_falls_through_to_available() {
        let b = map(&[
            (KEY_TOTAL_WALLET_BALANCE, 0.0),
            (KEY_TOTAL_UNREALIZED_PROFIT, 10.0),
            (KEY_AVAILABLE_BALANCE, 250.0),
        ]);
        let e = extract_total_equity(&b);
        assert!(e.ok);
        assert!(!e.used_total_equity);
        assert_eq!(e.equity, 250.0);
    }

    #[test]
    fn falls_back_to_plain_balance() {
        let b = map(&[(KEY_BALANCE, 123.45)]);
        let e = extract_total_equity(&b);
        assert!(e.ok);
        assert!(!e.used_total_equity);
        assert_eq!(e.equity, 123.45);
    }

    #[test]
    fn empty_map_fails() {
        let e = extract_total_equity(&BalanceMap::new());
        assert!(!e.ok);
        assert_eq!(e.equity, 0.0);
        assert!(!e.used_total_equity);
    }

    #[test]
    fn negative_unrealized_can_drag_equity_below_wallet() {
        let b = map(&[
            (KEY_TOTAL_WALLET_BALANCE, 100.0),
            (KEY_TOTAL_UNREALIZED_PROFIT, -40.0),
        ]);
        let e = extract_total_equity(&b);
        assert!(e.used_total_equity);
        assert_eq!(e.equity, 60.0);
    }
}
