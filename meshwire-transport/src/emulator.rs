//! # Network Emulator
//!
//! Fault injection on outbound traffic, per destination, for test scenarios.
//!
//! | Fault | Setting | Effect on each outbound frame |
//! |-------|---------|-------------------------------|
//! | Loss | `loss_percent` | dropped with that probability |
//! | Latency | `mean_delay` | delayed by an exponentially distributed sample with that mean |
//! | Block | [`NetworkEmulator::block`] | dropped until unblocked |
//!
//! Dropped frames still report a successful send: they model a network that
//! loses packets after the sender handed them off. Delayed frames may overtake
//! one another, so per-connection ordering does not hold under latency
//! injection.
//!
//! A disabled emulator is a pass-through: every frame is delivered at once.
//!
//! ```
//! use std::time::Duration;
//! use meshwire_transport::{Address, NetworkEmulator, NetworkSettings, Verdict};
//!
//! let emulator = NetworkEmulator::new(true);
//! let server = Address::new("127.0.0.1", 5800);
//!
//! emulator.set_network_settings(&server, NetworkSettings::new(100, Duration::ZERO));
//! assert_eq!(emulator.evaluate(&server), Verdict::Drop);
//!
//! emulator.remove_network_settings(&server);
//! assert_eq!(emulator.evaluate(&server), Verdict::Deliver { delay: Duration::ZERO });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use meshwire_core::Address;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

/// Loss and latency applied to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkSettings {
    /// Percentage of frames dropped, `0..=100`.
    pub loss_percent: u8,
    /// Mean extra latency. `Duration::ZERO` disables delays.
    pub mean_delay: Duration,
}

impl NetworkSettings {
    /// No loss, no delay.
    pub const NONE: NetworkSettings = NetworkSettings {
        loss_percent: 0,
        mean_delay: Duration::ZERO,
    };

    /// Settings with `loss_percent` clamped to 100.
    pub fn new(loss_percent: u8, mean_delay: Duration) -> Self {
        Self {
            loss_percent: loss_percent.min(100),
            mean_delay,
        }
    }

    fn is_noop(&self) -> bool {
        self.loss_percent == 0 && self.mean_delay.is_zero()
    }
}

/// What to do with one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Write it after `delay`.
    Deliver {
        /// Extra latency before the write.
        delay: Duration,
    },
    /// Silently discard it.
    Drop,
}

/// Counters over every frame the emulator evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmulatorStats {
    /// Frames evaluated.
    pub evaluated: u64,
    /// Frames dropped by loss or blocking.
    pub dropped: u64,
    /// Frames delivered with a non-zero delay.
    pub delayed: u64,
}

struct EmulatorState {
    default: NetworkSettings,
    per_destination: HashMap<Address, NetworkSettings>,
    blocked: HashSet<Address>,
    rng: StdRng,
}

/// Per-destination loss, latency and blocking for outbound frames.
pub struct NetworkEmulator {
    enabled: bool,
    state: Mutex<EmulatorState>,
    evaluated: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
}

impl NetworkEmulator {
    /// Create an emulator. A disabled one delivers everything immediately.
    pub fn new(enabled: bool) -> Self {
        Self::with_seed(enabled, rand::random())
    }

    /// Create an emulator with a fixed RNG seed for reproducible runs.
    pub fn with_seed(enabled: bool, seed: u64) -> Self {
        Self {
            enabled,
            state: Mutex::new(EmulatorState {
                default: NetworkSettings::NONE,
                per_destination: HashMap::new(),
                blocked: HashSet::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
            evaluated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        }
    }

    /// Whether the emulator interferes with traffic at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmulatorState> {
        // settings stay consistent even if a holder panicked
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn warn_if_disabled(&self, what: &str) {
        if !self.enabled {
            warn!("{what} ignored: network emulator is disabled");
        }
    }

    /// Settings for one destination.
    pub fn set_network_settings(&self, destination: &Address, settings: NetworkSettings) {
        self.warn_if_disabled("network settings");
        debug!(%destination, ?settings, "network settings updated");
        self.lock()
            .per_destination
            .insert(destination.clone(), settings);
    }

    /// Settings for destinations without their own.
    pub fn set_default_network_settings(&self, settings: NetworkSettings) {
        self.warn_if_disabled("default network settings");
        self.lock().default = settings;
    }

    /// Drop the destination's own settings, falling back to the default.
    pub fn remove_network_settings(&self, destination: &Address) {
        self.lock().per_destination.remove(destination);
    }

    /// Settings in effect for `destination`.
    pub fn network_settings(&self, destination: &Address) -> NetworkSettings {
        let state = self.lock();
        state
            .per_destination
            .get(destination)
            .copied()
            .unwrap_or(state.default)
    }

    /// Drop everything sent to `destination` until [`unblock`](Self::unblock).
    pub fn block(&self, destination: &Address) {
        self.warn_if_disabled("block");
        debug!(%destination, "blocking outbound traffic");
        self.lock().blocked.insert(destination.clone());
    }

    /// Restore traffic to `destination`.
    pub fn unblock(&self, destination: &Address) {
        debug!(%destination, "unblocking outbound traffic");
        self.lock().blocked.remove(destination);
    }

    /// Restore traffic to every destination.
    pub fn unblock_all(&self) {
        self.lock().blocked.clear();
    }

    /// Whether `destination` is blocked.
    pub fn is_blocked(&self, destination: &Address) -> bool {
        self.lock().blocked.contains(destination)
    }

    /// Decide the fate of one frame sent to `destination`.
    pub fn evaluate(&self, destination: &Address) -> Verdict {
        if !self.enabled {
            return Verdict::Deliver {
                delay: Duration::ZERO,
            };
        }
        self.evaluated.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if state.blocked.contains(destination) {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%destination, "frame dropped: destination blocked");
            return Verdict::Drop;
        }

        let settings = state
            .per_destination
            .get(destination)
            .copied()
            .unwrap_or(state.default);
        if settings.is_noop() {
            return Verdict::Deliver {
                delay: Duration::ZERO,
            };
        }

        if settings.loss_percent > 0
            && state
                .rng
                .random_bool(f64::from(settings.loss_percent) / 100.0)
        {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%destination, loss_percent = settings.loss_percent, "frame dropped: loss");
            return Verdict::Drop;
        }

        let delay = if settings.mean_delay.is_zero() {
            Duration::ZERO
        } else {
            let u: f64 = state.rng.random();
            exponential_sample(settings.mean_delay, u)
        };
        drop(state);
        if !delay.is_zero() {
            self.delayed.fetch_add(1, Ordering::Relaxed);
        }
        Verdict::Deliver { delay }
    }

    /// Counters since creation.
    pub fn stats(&self) -> EmulatorStats {
        EmulatorStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NetworkEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEmulator")
            .field("enabled", &self.enabled)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Inverse CDF of the exponential distribution with the given mean, `u` in `[0, 1)`.
fn exponential_sample(mean: Duration, u: f64) -> Duration {
    let factor = -(1.0 - u.clamp(0.0, 0.999_999)).ln();
    Duration::from_secs_f64(mean.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Address {
        Address::new("127.0.0.1", 5800)
    }

    #[test]
    fn test_disabled_is_pass_through() {
        let emulator = NetworkEmulator::new(false);
        emulator.set_network_settings(&server(), NetworkSettings::new(100, Duration::from_secs(1)));
        emulator.block(&server());
        for _ in 0..100 {
            assert_eq!(
                emulator.evaluate(&server()),
                Verdict::Deliver {
                    delay: Duration::ZERO
                }
            );
        }
        assert_eq!(emulator.stats(), EmulatorStats::default());
    }

    #[test]
    fn test_block_and_unblock() {
        let emulator = NetworkEmulator::with_seed(true, 1);
        let other = Address::new("127.0.0.1", 5801);

        emulator.block(&server());
        assert!(emulator.is_blocked(&server()));
        assert_eq!(emulator.evaluate(&server()), Verdict::Drop);
        assert!(matches!(emulator.evaluate(&other), Verdict::Deliver { .. }));

        emulator.unblock(&server());
        assert!(matches!(emulator.evaluate(&server()), Verdict::Deliver { .. }));

        emulator.block(&server());
        emulator.block(&other);
        emulator.unblock_all();
        assert!(!emulator.is_blocked(&server()));
        assert!(!emulator.is_blocked(&other));
    }

    #[test]
    fn test_loss_rate_close_to_configured() {
        let emulator = NetworkEmulator::with_seed(true, 42);
        emulator.set_network_settings(&server(), NetworkSettings::new(50, Duration::ZERO));

        let total = 10_000;
        let dropped = (0..total)
            .filter(|_| emulator.evaluate(&server()) == Verdict::Drop)
            .count();
        assert!(
            (4_500..5_500).contains(&dropped),
            "dropped {dropped} of {total}"
        );
        let stats = emulator.stats();
        assert_eq!(stats.evaluated, total as u64);
        assert_eq!(stats.dropped, dropped as u64);
    }

    #[test]
    fn test_default_settings_apply_to_unconfigured_destinations() {
        let emulator = NetworkEmulator::with_seed(true, 7);
        emulator.set_default_network_settings(NetworkSettings::new(100, Duration::ZERO));
        let lucky = Address::new("127.0.0.1", 9);
        emulator.set_network_settings(&lucky, NetworkSettings::NONE);

        assert_eq!(emulator.evaluate(&server()), Verdict::Drop);
        assert!(matches!(emulator.evaluate(&lucky), Verdict::Deliver { .. }));
        assert_eq!(
            emulator.network_settings(&server()).loss_percent,
            100,
            "default applies"
        );
    }

    #[test]
    fn test_delay_mean_is_respected() {
        let emulator = NetworkEmulator::with_seed(true, 3);
        let mean = Duration::from_millis(10);
        emulator.set_network_settings(&server(), NetworkSettings::new(0, mean));

        let samples: u32 = 5_000;
        let total: Duration = (0..samples)
            .map(|_| match emulator.evaluate(&server()) {
                Verdict::Deliver { delay } => delay,
                Verdict::Drop => panic!("no loss configured"),
            })
            .sum();
        let average = total / samples;
        assert!(
            average > Duration::from_millis(8) && average < Duration::from_millis(12),
            "average delay {average:?}"
        );
    }

    #[test]
    fn test_loss_percent_clamped() {
        assert_eq!(NetworkSettings::new(250, Duration::ZERO).loss_percent, 100);
    }

    #[test]
    fn test_exponential_sample_bounds() {
        let mean = Duration::from_millis(100);
        assert_eq!(exponential_sample(mean, 0.0), Duration::ZERO);
        assert!(exponential_sample(mean, 0.5) < mean);
        assert!(exponential_sample(mean, 0.9) > mean);
        // u = 1 would be infinite
        assert!(exponential_sample(mean, 1.0) < Duration::from_secs(2));
    }
}
