//! Replay protection for handshake hellos.
//!
//! A hello carries `(ts_ms, nonce)`. The guard rejects timestamps outside
//! the accepted skew window and nonces it has already seen within that
//! window. Seen entries are pruned as the window slides, so memory stays
//! bounded by the hello rate.

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::error::CryptoError;

/// Default accepted clock skew between peers: 30 seconds either way.
pub const DEFAULT_WINDOW_MS: u64 = 30_000;

pub struct ReplayGuard {
    window_ms: u64,
    /// Seen hellos, keyed by timestamp for cheap pruning.
    seen: BTreeMap<u64, HashSet<[u8; 16]>>,
}

impl ReplayGuard {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            seen: BTreeMap::new(),
        }
    }

    /// Validate `(ts_ms, nonce)` against `now_ms` and record it.
    ///
    /// Errors with `StaleTimestamp` when the timestamp is outside the skew
    /// window, `Replayed` when the exact pair was already accepted.
    pub fn check_and_record(
        &mut self,
        ts_ms: u64,
        nonce: [u8; 16],
        now_ms: u64,
    ) -> Result<(), CryptoError> {
        let skew = ts_ms as i64 - now_ms as i64;
        if skew.unsigned_abs() > self.window_ms {
            return Err(CryptoError::StaleTimestamp { skew_ms: skew });
        }

        self.prune(now_ms);

        let entry = self.seen.entry(ts_ms).or_default();
        if !entry.insert(nonce) {
            return Err(CryptoError::Replayed);
        }
        Ok(())
    }

    /// Drop entries that have slid out of the window.
    fn prune(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.window_ms);
        self.seen = self.seen.split_off(&horizon);
    }

    #[cfg(test)]
    fn recorded(&self) -> usize {
        self.seen.values().map(|s| s.len()).sum()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_fresh_hello() {
        let mut guard = ReplayGuard::default();
        guard.check_and_record(10_000, [1; 16], 10_000).unwrap();
    }

    #[test]
    fn rejects_replay() {
        let mut guard = ReplayGuard::default();
        guard.check_and_record(10_000, [1; 16], 10_000).unwrap();
        assert!(matches!(
            guard.check_and_record(10_000, [1; 16], 10_001),
            Err(CryptoError::Replayed)
        ));
    }

    #[test]
    fn same_timestamp_different_nonce_accepted() {
        let mut guard = ReplayGuard::default();
        guard.check_and_record(10_000, [1; 16], 10_000).unwrap();
        guard.check_and_record(10_000, [2; 16], 10_000).unwrap();
    }

    #[test]
    fn rejects_stale_timestamp() {
        let mut guard = ReplayGuard::new(5_000);
        let err = guard.check_and_record(1_000, [1; 16], 60_000);
        assert!(matches!(err, Err(CryptoError::StaleTimestamp { .. })));
    }

    #[test]
    fn rejects_future_timestamp() {
        let mut guard = ReplayGuard::new(5_000);
        assert!(guard.check_and_record(66_000, [1; 16], 60_000).is_err());
    }

    #[test]
    fn prunes_expired_entries() {
        let mut guard = ReplayGuard::new(5_000);
        guard.check_and_record(10_000, [1; 16], 10_000).unwrap();
        guard.check_and_record(20_000, [2; 16], 20_000).unwrap();
        assert_eq!(guard.recorded(), 1);

        // The pruned nonce is replayable in principle, but its timestamp is
        // now stale, so the pair still cannot be reused.
        assert!(guard.check_and_record(10_000, [1; 16], 20_000).is_err());
    }
}
