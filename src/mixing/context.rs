// src/mixing/context.rs
use crate::types::{Phase, Strategy};

/// The phase that follows `current` for a given strategy, or `None` once
/// the strategy's terminal phase has completed.
pub fn next_phase(strategy: Strategy, current: Phase) -> Option<Phase> {
    match (strategy, current) {
        (Strategy::CoinJoin, Phase::Coordination) => Some(Phase::Signing),
        (Strategy::CoinJoin, Phase::Signing) => Some(Phase::Broadcast),
        (Strategy::CoinJoin, Phase::Broadcast) => None,

        (Strategy::PoolMixing, Phase::PoolEntry) => Some(Phase::Mixing),
        (Strategy::PoolMixing, Phase::Mixing) => Some(Phase::Distribution),
        (Strategy::PoolMixing, Phase::Distribution) => None,

        (Strategy::FastMix, Phase::Obfuscation) => Some(Phase::Transfer),
        (Strategy::FastMix, Phase::Transfer) => None,

        _ => None,
    }
}

/// Progress percentage reported by `status()` for a phase position,
/// interpolating evenly across each strategy's fixed phase count.
pub fn progress_for_phase(strategy: Strategy, phase: Phase) -> u8 {
    let phases: &[Phase] = match strategy {
        Strategy::CoinJoin => &[Phase::Coordination, Phase::Signing, Phase::Broadcast],
        Strategy::PoolMixing => &[Phase::PoolEntry, Phase::Mixing, Phase::Distribution],
        Strategy::FastMix => &[Phase::Obfuscation, Phase::Transfer],
    };
    let position = phases.iter().position(|p| *p == phase).unwrap_or(0);
    let total = phases.len().max(1);
    (((position + 1) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinjoin_phases_advance_in_order() {
        assert_eq!(next_phase(Strategy::CoinJoin, Phase::Coordination), Some(Phase::Signing));
        assert_eq!(next_phase(Strategy::CoinJoin, Phase::Signing), Some(Phase::Broadcast));
        assert_eq!(next_phase(Strategy::CoinJoin, Phase::Broadcast), None);
    }

    #[test]
    fn pool_mixing_phases_advance_in_order() {
        assert_eq!(next_phase(Strategy::PoolMixing, Phase::PoolEntry), Some(Phase::Mixing));
        assert_eq!(next_phase(Strategy::PoolMixing, Phase::Mixing), Some(Phase::Distribution));
        assert_eq!(next_phase(Strategy::PoolMixing, Phase::Distribution), None);
    }

    #[test]
    fn fast_mix_phases_advance_in_order() {
        assert_eq!(next_phase(Strategy::FastMix, Phase::Obfuscation), Some(Phase::Transfer));
        assert_eq!(next_phase(Strategy::FastMix, Phase::Transfer), None);
    }

    #[test]
    fn progress_reaches_100_at_terminal_phase() {
        assert_eq!(progress_for_phase(Strategy::FastMix, Phase::Transfer), 100);
        assert_eq!(progress_for_phase(Strategy::CoinJoin, Phase::Broadcast), 100);
    }
}
