// Prometheus metrics for a proxy instance
//
// Each proxy owns its own registry so several proxies can run inside one test
// process. Exposed as text on the control server's GET /metrics.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges for one proxy instance
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Byte-mode sessions that reached the backend
    pub sessions_accepted: IntCounter,

    /// Byte-mode sessions currently registered
    pub sessions_active: IntGauge,

    /// Sessions closed by kill-all or forceful shutdown
    pub sessions_killed: IntCounter,

    /// Connections or calls turned away by a rejecting gate
    pub rejected: IntCounter,

    /// Failed backend dials
    pub dial_failures: IntCounter,

    /// Calls forwarded to the backend (call-aware mode)
    pub calls_forwarded: IntCounter,

    /// Completed restarts
    pub restarts: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_accepted = IntCounter::new(
            "fault_proxy_sessions_accepted_total",
            "Sessions paired with a backend connection",
        )?;
        let sessions_active = IntGauge::new(
            "fault_proxy_sessions_active",
            "Sessions currently tracked in the session table",
        )?;
        let sessions_killed = IntCounter::new(
            "fault_proxy_sessions_killed_total",
            "Sessions closed by kill-all or forceful shutdown",
        )?;
        let rejected = IntCounter::new(
            "fault_proxy_rejected_total",
            "Connections or calls rejected by the gate",
        )?;
        let dial_failures = IntCounter::new(
            "fault_proxy_dial_failures_total",
            "Failed attempts to dial the backend",
        )?;
        let calls_forwarded = IntCounter::new(
            "fault_proxy_calls_forwarded_total",
            "Calls forwarded to the backend",
        )?;
        let restarts = IntCounter::new("fault_proxy_restarts_total", "Completed restarts")?;

        registry.register(Box::new(sessions_accepted.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_killed.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(dial_failures.clone()))?;
        registry.register(Box::new(calls_forwarded.clone()))?;
        registry.register(Box::new(restarts.clone()))?;

        Ok(Self {
            registry,
            sessions_accepted,
            sessions_active,
            sessions_killed,
            rejected,
            dial_failures,
            calls_forwarded,
            restarts,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.rejected.inc();
        metrics.sessions_active.set(2);

        let text = metrics.gather().unwrap();
        assert!(text.contains("fault_proxy_rejected_total 1"));
        assert!(text.contains("fault_proxy_sessions_active 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ProxyMetrics::new().unwrap();
        let b = ProxyMetrics::new().unwrap();
        a.restarts.inc();
        assert_eq!(a.restarts.get(), 1);
        assert_eq!(b.restarts.get(), 0);
    }
}
