// src/metrics/collector.rs
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use anyhow::Result;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);
        
        Ok(Self {
            registry,
            collector,
        })
    }
    
    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }
    
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Listener metrics
    pub connections_accepted_total: IntCounter,
    pub connections_rejected_total: IntCounterVec,
    pub accept_errors_total: IntCounter,
    
    // Connection metrics
    pub active_connections: IntGauge,
    pub requests_total: IntCounter,
    pub connection_errors_total: IntCounterVec,
    
    // Admission metrics
    pub rate_limiter_entries: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let connections_accepted_total = IntCounter::new(
            "tcp_connections_accepted_total",
            "Accepted connections admitted to a pipeline",
        )?;
        registry.register(Box::new(connections_accepted_total.clone()))?;
        
        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "tcp_connections_rejected_total",
                "Connections closed by admission control",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_rejected_total.clone()))?;
        
        let accept_errors_total = IntCounter::new(
            "tcp_accept_errors_total",
            "Transient accept failures",
        )?;
        registry.register(Box::new(accept_errors_total.clone()))?;
        
        let active_connections =
            IntGauge::new("tcp_active_connections", "Connections with a running pipeline")?;
        registry.register(Box::new(active_connections.clone()))?;
        
        let requests_total =
            IntCounter::new("tcp_requests_total", "Requests read and answered")?;
        registry.register(Box::new(requests_total.clone()))?;
        
        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "tcp_connection_errors_total",
                "Connections ended by a pipeline error",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(connection_errors_total.clone()))?;
        
        let rate_limiter_entries = IntGauge::new(
            "tcp_rate_limiter_entries",
            "Remote hosts tracked by the rate limiter",
        )?;
        registry.register(Box::new(rate_limiter_entries.clone()))?;
        
        Ok(Self {
            connections_accepted_total,
            connections_rejected_total,
            accept_errors_total,
            active_connections,
            requests_total,
            connection_errors_total,
            rate_limiter_entries,
        })
    }
    
    pub fn record_accepted(&self) {
        self.connections_accepted_total.inc();
    }
    
    pub fn record_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }
    
    pub fn record_accept_error(&self) {
        self.accept_errors_total.inc();
    }
    
    pub fn record_request(&self) {
        self.requests_total.inc();
    }
    
    pub fn record_connection_error(&self, stage: &str) {
        self.connection_errors_total
            .with_label_values(&[stage])
            .inc();
    }
    
    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }
    
    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }
    
    pub fn update_rate_limiter_entries(&self, entries: usize) {
        self.rate_limiter_entries.set(entries as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_renders_recorded_values() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();
        
        metrics.record_accepted();
        metrics.record_accepted();
        metrics.record_rejected("rate_limited");
        metrics.record_connection_error("read");
        metrics.increment_active_connections();
        
        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains("tcp_connections_accepted_total 2"));
        assert!(text.contains("tcp_connections_rejected_total{reason=\"rate_limited\"} 1"));
        assert!(text.contains("tcp_connection_errors_total{stage=\"read\"} 1"));
        assert!(text.contains("tcp_active_connections 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(MetricsCollector::new(&registry).is_ok());
        assert!(MetricsCollector::new(&registry).is_err());
    }
}
