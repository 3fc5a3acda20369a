// src/mixing/strategy.rs
use rust_decimal::Decimal;

use crate::types::{Currency, MixRequest, MixStatus, Strategy};

/// A candidate request is "nearby" another if it shares a currency, is not
/// expired, and its amount sits within the ±10% band used for CoinJoin
/// participant grouping.
pub fn is_band_candidate(target: &MixRequest, other: &MixRequest, now: chrono::DateTime<chrono::Utc>) -> bool {
    if other.id == target.id {
        return false;
    }
    if other.currency != target.currency {
        return false;
    }
    if other.expires_at <= now {
        return false;
    }
    if !matches!(other.status, MixStatus::Deposited | MixStatus::Pooling) {
        return false;
    }
    let lower = target.input_amount * Decimal::new(90, 2);
    let upper = target.input_amount * Decimal::new(110, 2);
    other.input_amount >= lower && other.input_amount <= upper
}

pub fn band_candidates<'a>(
    target: &MixRequest,
    others: &'a [MixRequest],
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<&'a MixRequest> {
    others.iter().filter(|other| is_band_candidate(target, other, now)).collect()
}

/// Picks a strategy for `target` given its CoinJoin-band peers and the
/// currency's current pool size. CoinJoin requires enough banded peers to
/// form a real join; failing that, a sufficiently large pool allows
/// PoolMixing; otherwise the request falls back to FastMix.
pub fn select_strategy(
    band_peer_count: usize,
    pool_size: Decimal,
    min_coinjoin_participants: usize,
    min_pool_size: u32,
) -> Strategy {
    if band_peer_count + 1 >= min_coinjoin_participants {
        Strategy::CoinJoin
    } else if pool_size >= Decimal::from(min_pool_size) {
        Strategy::PoolMixing
    } else {
        Strategy::FastMix
    }
}

/// Used when a CoinJoin in `Coordination` can't retain enough participants
/// by `coordination_timeout` — it falls back exactly the way a fresh
/// submission would, minus the peers that already dropped out.
pub fn downgrade_after_coordination_timeout(
    remaining_participants: usize,
    pool_size: Decimal,
    min_coinjoin_participants: usize,
    min_pool_size: u32,
) -> Strategy {
    if remaining_participants >= min_coinjoin_participants {
        Strategy::CoinJoin
    } else if pool_size >= Decimal::from(min_pool_size) {
        Strategy::PoolMixing
    } else {
        Strategy::FastMix
    }
}
