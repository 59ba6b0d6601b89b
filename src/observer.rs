//! Observer capability: an opaque sink for stage events.
//!
//! Grounded on a fan-out-to-multiple-exporters observer hub, generalized
//! from concrete audit-log exporters to the stage-event channel §9's design
//! notes call for in place of a global event bus.

use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum StageEvent {
    Decision {
        routing_id: String,
        pool_id: String,
        match_score: f64,
        fallback_used: bool,
    },
    Execute {
        pool_id: String,
        success: bool,
        duration_ms: f64,
    },
    HealthCheck {
        pool_id: String,
        healthy: bool,
    },
}

/// Default no-op implementation so callers never need to null-check
/// (§9's re-architecture of "mock/empty modules").
pub trait Observer: Send + Sync {
    fn on_decision(&self, _routing_id: &str, _pool_id: &str, _match_score: f64, _fallback_used: bool) {}
    fn on_execute(&self, _pool_id: &str, _success: bool, _duration_ms: f64) {}
    fn on_health_check(&self, _pool_id: &str, _healthy: bool) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards every stage event over an mpsc channel. Subscribers `recv()`
/// from the paired receiver; a full channel drops the oldest silently
/// rather than blocking the hot path.
pub struct ChannelObserver {
    sender: mpsc::Sender<StageEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StageEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ChannelObserver { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn on_decision(&self, routing_id: &str, pool_id: &str, match_score: f64, fallback_used: bool) {
        let _ = self.sender.try_send(StageEvent::Decision {
            routing_id: routing_id.to_string(),
            pool_id: pool_id.to_string(),
            match_score,
            fallback_used,
        });
    }

    fn on_execute(&self, pool_id: &str, success: bool, duration_ms: f64) {
        let _ = self.sender.try_send(StageEvent::Execute {
            pool_id: pool_id.to_string(),
            success,
            duration_ms,
        });
    }

    fn on_health_check(&self, pool_id: &str, healthy: bool) {
        let _ = self.sender.try_send(StageEvent::HealthCheck {
            pool_id: pool_id.to_string(),
            healthy,
        });
    }
}

pub type SharedObserver = Arc<dyn Observer>;
