use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::secret::{CancelSecret, RenewalSecret};

/// Source of wall-clock time, in seconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        ManualClock(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// One client's time-bounded claim on a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub renew_secret: RenewalSecret,
    pub cancel_secret: CancelSecret,
    /// When the lease was created or last renewed.
    pub granted_at: u64,
    pub expires_at: u64,
}

impl LeaseInfo {
    pub fn new(renew_secret: RenewalSecret, cancel_secret: CancelSecret, now: u64, duration: u64) -> Self {
        LeaseInfo {
            renew_secret,
            cancel_secret,
            granted_at: now,
            expires_at: now.saturating_add(duration),
        }
    }

    /// Extends the lease. A renewal never moves the expiration earlier.
    pub fn renew(&mut self, now: u64, new_expiration: u64) {
        self.granted_at = now;
        self.expires_at = self.expires_at.max(new_expiration);
    }

    pub fn duration(&self) -> u64 {
        self.expires_at.saturating_sub(self.granted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HASH_SIZE;

    fn lease(now: u64, duration: u64) -> LeaseInfo {
        LeaseInfo::new(
            RenewalSecret::from_bytes([1; HASH_SIZE]),
            CancelSecret::from_bytes([2; HASH_SIZE]),
            now,
            duration,
        )
    }

    #[test]
    fn test_renew_never_shortens() {
        let mut lease = lease(100, 50);
        lease.renew(120, 130);
        assert_eq!(lease.expires_at, 150);
        assert_eq!(lease.granted_at, 120);

        lease.renew(140, 500);
        assert_eq!(lease.expires_at, 500);
        assert_eq!(lease.duration(), 360);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now(), 15);
        clock.set(3);
        assert_eq!(clock.now(), 3);
    }
}
