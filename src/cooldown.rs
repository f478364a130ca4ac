use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::model::CooldownKey;

/// Per-key time-based suppression, shared across the detector->dispatcher
/// boundary. Keys expire lazily on query, never via a background sweep --
/// a cooldown of `Duration::ZERO` therefore disables suppression entirely
/// (the very next query always observes `now >= expiry`).
pub struct CooldownRegistry {
    expiries: Mutex<HashMap<CooldownKey, Instant>>,
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self {
            expiries: Mutex::new(HashMap::new()),
        }
    }

    /// `true` if `key` is still within its cooldown window. Expired
    /// entries are removed as a side effect.
    pub fn in_cooldown(&self, key: &CooldownKey) -> bool {
        let mut expiries = self.expiries.lock();
        match expiries.get(key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                expiries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Start (or restart) the cooldown window for `key`.
    pub fn mark(&self, key: CooldownKey, duration: Duration) {
        let expiry = Instant::now() + duration;
        self.expiries.lock().insert(key, expiry);
    }

    pub fn active_count(&self) -> usize {
        self.expiries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectorKind, Side};
    use std::thread::sleep;

    fn key() -> CooldownKey {
        CooldownKey::new(DetectorKind::Single, "BTCUSDT", Side::Buy)
    }

    #[test]
    fn fresh_key_is_not_in_cooldown() {
        let registry = CooldownRegistry::new();
        assert!(!registry.in_cooldown(&key()));
    }

    #[test]
    fn marked_key_is_in_cooldown_until_it_elapses() {
        let registry = CooldownRegistry::new();
        registry.mark(key(), Duration::from_millis(50));
        assert!(registry.in_cooldown(&key()));
        sleep(Duration::from_millis(80));
        assert!(!registry.in_cooldown(&key()));
    }

    #[test]
    fn zero_duration_cooldown_disables_suppression() {
        let registry = CooldownRegistry::new();
        registry.mark(key(), Duration::ZERO);
        // the expiry instant is now-ish; by the time we check, it has passed
        sleep(Duration::from_millis(5));
        assert!(!registry.in_cooldown(&key()));
    }

    #[test]
    fn independent_keys_do_not_interfere() {
        let registry = CooldownRegistry::new();
        let buy = CooldownKey::new(DetectorKind::Single, "BTCUSDT", Side::Buy);
        let sell = CooldownKey::new(DetectorKind::Single, "BTCUSDT", Side::Sell);
        registry.mark(buy.clone(), Duration::from_secs(60));
        assert!(registry.in_cooldown(&buy));
        assert!(!registry.in_cooldown(&sell));
    }
}
