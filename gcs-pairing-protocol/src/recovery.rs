//! Automatic Reconnection
//!
//! The [`ReconnectSupervisor`] decides, once per jittered interval, which
//! paired devices need a new link attempt:
//! - paired devices without an active link are candidates
//! - at most one attempt per device is outstanding at any time
//! - devices the operator disconnected are skipped until resumed
//! - failures are counted per device and never escalate; the device is
//!   simply retried on the next sweep
//!
//! The supervisor holds no timers and performs no I/O. The pairing manager
//! drives it from its event loop and reports each attempt back through
//! [`ReconnectSupervisor::finish`].

use crate::device::DeviceRegistry;
use crate::transport::LinkTarget;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Default base interval between reconnect sweeps
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum random delay added to each interval
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_secs(2);

/// Timing of reconnect sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Base interval between sweeps
    pub interval: Duration,
    /// Upper bound of the random delay added to each interval
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Delay until the next sweep: interval plus uniform jitter
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.interval + Duration::from_millis(extra)
    }
}

/// Per-device reconnection bookkeeping
#[derive(Debug)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    enabled: bool,
    in_flight: HashSet<String>,
    suspended: HashSet<String>,
    failures: HashMap<String, u32>,
    sweeps: u64,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            enabled: true,
            in_flight: HashSet::new(),
            suspended: HashSet::new(),
            failures: HashMap::new(),
            sweeps: 0,
        }
    }

    /// Delay until the next sweep
    pub fn next_delay(&self) -> Duration {
        self.policy.next_delay()
    }

    /// Pause or resume sweeping altogether
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Number of sweeps performed so far
    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    /// Select devices for a reconnect attempt and mark them in flight
    pub fn sweep(&mut self, registry: &DeviceRegistry) -> Vec<LinkTarget> {
        if !self.enabled {
            return Vec::new();
        }
        self.sweeps += 1;

        let mut targets = Vec::new();
        for device in registry.list_disconnected().iter() {
            if self.suspended.contains(&device.name) {
                continue;
            }
            if self.try_begin(&device.name) {
                targets.push(LinkTarget::from(device));
            }
        }

        if !targets.is_empty() {
            debug!(
                "Reconnect sweep {}: {} device(s) to retry",
                self.sweeps,
                targets.len()
            );
        }
        targets
    }

    /// Claim the single in-flight slot of a device
    ///
    /// Returns `false` if an attempt is already outstanding.
    pub fn try_begin(&mut self, device_name: &str) -> bool {
        self.in_flight.insert(device_name.to_string())
    }

    pub fn is_in_flight(&self, device_name: &str) -> bool {
        self.in_flight.contains(device_name)
    }

    /// Release the in-flight slot and record the outcome
    ///
    /// Returns the consecutive failure count after this attempt.
    pub fn finish(&mut self, device_name: &str, success: bool) -> u32 {
        self.in_flight.remove(device_name);
        if success {
            self.failures.remove(device_name);
            return 0;
        }

        let failures = self.failures.entry(device_name.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        *failures
    }

    /// Consecutive failed attempts of a device
    pub fn failures(&self, device_name: &str) -> u32 {
        self.failures.get(device_name).copied().unwrap_or(0)
    }

    /// Stop reconnecting a device until [`ReconnectSupervisor::resume`]
    pub fn suspend(&mut self, device_name: &str) {
        self.suspended.insert(device_name.to_string());
    }

    /// Allow reconnecting a device again; returns whether it was suspended
    pub fn resume(&mut self, device_name: &str) -> bool {
        self.suspended.remove(device_name)
    }

    pub fn is_suspended(&self, device_name: &str) -> bool {
        self.suspended.contains(device_name)
    }

    /// Drop the state of a device that was unpaired
    ///
    /// An attempt still outstanding keeps its in-flight slot until it is
    /// resolved through [`ReconnectSupervisor::release`].
    pub fn forget(&mut self, device_name: &str) {
        self.suspended.remove(device_name);
        self.failures.remove(device_name);
    }

    /// Release the in-flight slot without recording an outcome
    pub fn release(&mut self, device_name: &str) {
        self.in_flight.remove(device_name);
        self.failures.remove(device_name);
    }
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedSecret;
    use crate::device::Device;
    use tempfile::TempDir;

    fn registry_with(names: &[(&str, u16)]) -> (TempDir, DeviceRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = DeviceRegistry::open(temp_dir.path()).unwrap();
        for (name, channel) in names {
            registry
                .upsert(Device::new(
                    *name,
                    "MIIB",
                    "10.0.0.1".parse().unwrap(),
                    *channel,
                    SealedSecret {
                        nonce: String::new(),
                        data: String::new(),
                    },
                ))
                .unwrap();
        }
        (temp_dir, registry)
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }

        let fixed = ReconnectPolicy {
            interval: Duration::from_secs(1),
            jitter: Duration::ZERO,
        };
        assert_eq!(fixed.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_sweep_skips_in_flight() {
        let (_dir, registry) = registry_with(&[("a", 1), ("b", 2)]);
        let mut supervisor = ReconnectSupervisor::default();

        let first: Vec<_> = supervisor.sweep(&registry).into_iter().map(|t| t.device_name).collect();
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);

        // Nothing resolved yet: no duplicate attempts
        assert!(supervisor.sweep(&registry).is_empty());

        supervisor.finish("a", false);
        let third: Vec<_> = supervisor.sweep(&registry).into_iter().map(|t| t.device_name).collect();
        assert_eq!(third, vec!["a".to_string()]);
        assert_eq!(supervisor.sweeps(), 3);
    }

    #[test]
    fn test_sweep_skips_connected_and_suspended() {
        let (_dir, mut registry) = registry_with(&[("a", 1), ("b", 2), ("c", 3)]);
        registry.mark_connected("a").unwrap();

        let mut supervisor = ReconnectSupervisor::default();
        supervisor.suspend("b");

        let targets = supervisor.sweep(&registry);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].device_name, "c");
        assert_eq!(targets[0].channel, 3);

        assert!(supervisor.resume("b"));
        assert!(!supervisor.resume("b"));
        supervisor.finish("c", true);
        assert_eq!(supervisor.sweep(&registry).len(), 2);
    }

    #[test]
    fn test_disabled_supervisor_does_nothing() {
        let (_dir, registry) = registry_with(&[("a", 1)]);
        let mut supervisor = ReconnectSupervisor::default();
        supervisor.set_enabled(false);

        assert!(supervisor.sweep(&registry).is_empty());
        assert_eq!(supervisor.sweeps(), 0);
    }

    #[test]
    fn test_failure_counting() {
        let mut supervisor = ReconnectSupervisor::default();
        assert!(supervisor.try_begin("a"));
        assert!(!supervisor.try_begin("a"));
        assert_eq!(supervisor.finish("a", false), 1);
        assert!(supervisor.try_begin("a"));
        assert_eq!(supervisor.finish("a", false), 2);
        assert_eq!(supervisor.failures("a"), 2);
        assert!(supervisor.try_begin("a"));
        assert_eq!(supervisor.finish("a", true), 0);
        assert_eq!(supervisor.failures("a"), 0);

        supervisor.try_begin("b");
        supervisor.suspend("b");
        supervisor.forget("b");
        assert!(!supervisor.is_suspended("b"));
    }

    #[test]
    fn test_forget_keeps_outstanding_attempt() {
        let mut supervisor = ReconnectSupervisor::default();
        assert!(supervisor.try_begin("a"));
        assert_eq!(supervisor.finish("a", false), 1);
        assert!(supervisor.try_begin("a"));

        supervisor.forget("a");
        assert_eq!(supervisor.failures("a"), 0);
        assert!(supervisor.is_in_flight("a"));
        assert!(!supervisor.try_begin("a"));

        supervisor.release("a");
        assert!(!supervisor.is_in_flight("a"));
        assert_eq!(supervisor.failures("a"), 0);
        assert!(supervisor.try_begin("a"));
    }
}
