//! Broker connection health tracking

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::metrics::BrokerMetrics;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Not connected yet, or lost and reconnecting
    Reconnecting,
    /// Circuit breaker is open, not attempting connections
    CircuitOpen,
    /// Deliberately disconnected by the owner
    Disconnected,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Reconnecting => "reconnecting",
            HealthStatus::CircuitOpen => "circuit_open",
            HealthStatus::Disconnected => "disconnected",
        }
    }
}

/// Health tracker for one broker connection
pub struct ConnectionHealth {
    backend: &'static str,
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
    total_reconnections: AtomicU32,
}

impl ConnectionHealth {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            status: AtomicU8::new(HealthStatus::Reconnecting as u8),
            last_connected: AtomicI64::new(0),
            reconnection_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
        }
    }

    pub fn set_connected(&self) {
        let previous = self.status.swap(HealthStatus::Healthy as u8, Ordering::AcqRel);
        let previously_connected_at = self.last_connected.swap(current_time_ms(), Ordering::AcqRel);

        // Only count recoveries, not the first connect
        if previous != HealthStatus::Healthy as u8 && previously_connected_at > 0 {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
        self.reconnection_attempts.store(0, Ordering::Release);
        BrokerMetrics::set_connected(self.backend, true);
    }

    pub fn set_reconnecting(&self) {
        self.status.store(HealthStatus::Reconnecting as u8, Ordering::Release);
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
        BrokerMetrics::set_connected(self.backend, false);
    }

    pub fn set_circuit_open(&self) {
        self.status.store(HealthStatus::CircuitOpen as u8, Ordering::Release);
        BrokerMetrics::set_connected(self.backend, false);
    }

    pub fn set_disconnected(&self) {
        self.status.store(HealthStatus::Disconnected as u8, Ordering::Release);
        BrokerMetrics::set_connected(self.backend, false);
    }

    pub fn status(&self) -> HealthStatus {
        match self.status.load(Ordering::Acquire) {
            0 => HealthStatus::Healthy,
            2 => HealthStatus::CircuitOpen,
            3 => HealthStatus::Disconnected,
            _ => HealthStatus::Reconnecting,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStats {
    pub status: HealthStatus,
    pub last_connected_ms: i64,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_transitions() {
        let health = ConnectionHealth::new("test");
        assert_eq!(health.status(), HealthStatus::Reconnecting);
        assert!(!health.is_healthy());

        health.set_connected();
        assert!(health.is_healthy());

        health.set_disconnected();
        assert_eq!(health.status(), HealthStatus::Disconnected);
        assert_eq!(health.status().as_str(), "disconnected");
    }

    #[test]
    fn test_reconnect_attempts_reset_on_connect() {
        let health = ConnectionHealth::new("test");

        health.set_reconnecting();
        health.set_reconnecting();
        assert_eq!(health.stats().reconnection_attempts, 2);

        health.set_connected();
        let stats = health.stats();
        assert_eq!(stats.status, HealthStatus::Healthy);
        assert_eq!(stats.reconnection_attempts, 0);
        assert!(stats.last_connected_ms > 0);
        assert_eq!(stats.total_reconnections, 0);

        health.set_reconnecting();
        health.set_connected();
        assert_eq!(health.stats().total_reconnections, 1);
    }
}
