//! Keep-alive liveness check.
//!
//! The monitor is a plain state machine; the network layer owns the timer
//! and calls [`KeepaliveMonitor::on_tick`] once per interval.

use std::time::Duration;

/// What the connection should do after one interval elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Traffic arrived recently, or keep-alive is not active.
    Idle,
    /// Send a PING and keep waiting.
    SendPing,
    /// `count` intervals passed in silence; tear the connection down.
    Dead,
}

#[derive(Debug, Clone)]
pub struct KeepaliveMonitor {
    interval: Option<Duration>,
    count: u32,
    missed: u32,
}

impl KeepaliveMonitor {
    /// `interval_secs <= 0` disables the check.
    pub fn new(interval_secs: i64, count: u32) -> Self {
        let interval = u64::try_from(interval_secs)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        Self {
            interval,
            count,
            missed: 0,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Any inbound frame proves the peer is alive.
    pub fn on_inbound(&mut self) {
        self.missed = 0;
    }

    /// Advances one interval. `peer_supports` is whether the client declared
    /// keep-alive support; the server never pings a peer that has not.
    pub fn on_tick(&mut self, peer_supports: bool) -> KeepaliveAction {
        if self.interval.is_none() || !peer_supports {
            return KeepaliveAction::Idle;
        }
        self.missed += 1;
        if self.count > 0 && self.missed > self.count {
            KeepaliveAction::Dead
        } else {
            KeepaliveAction::SendPing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_interval_disables() {
        let mut m = KeepaliveMonitor::new(-1, 5);
        assert!(!m.is_enabled());
        for _ in 0..10 {
            assert_eq!(m.on_tick(true), KeepaliveAction::Idle);
        }
    }

    #[test]
    fn test_silent_peer_dies_after_count_pings() {
        // Arrange
        let mut m = KeepaliveMonitor::new(5, 2);

        // Act / Assert
        assert_eq!(m.on_tick(true), KeepaliveAction::SendPing);
        assert_eq!(m.on_tick(true), KeepaliveAction::SendPing);
        assert_eq!(m.on_tick(true), KeepaliveAction::Dead);
    }

    #[test]
    fn test_inbound_traffic_resets_the_count() {
        let mut m = KeepaliveMonitor::new(5, 1);
        assert_eq!(m.on_tick(true), KeepaliveAction::SendPing);
        m.on_inbound();
        assert_eq!(m.on_tick(true), KeepaliveAction::SendPing);
        assert_eq!(m.on_tick(true), KeepaliveAction::Dead);
    }

    #[test]
    fn test_peer_without_support_is_never_pinged() {
        let mut m = KeepaliveMonitor::new(5, 1);
        assert_eq!(m.on_tick(false), KeepaliveAction::Idle);
        assert_eq!(m.on_tick(false), KeepaliveAction::Idle);
        assert_eq!(m.interval(), Some(Duration::from_secs(5)));
    }
}
