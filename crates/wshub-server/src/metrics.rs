//! Prometheus metrics for the hub.
//!
//! Each hub owns its own [`Registry`] so several hubs (and tests) in one
//! process never share counts.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use wshub_core::{HubError, HubResult};

/// Live-connection gauge plus the registry it is exported from.
#[derive(Clone)]
pub struct HubMetrics {
    registry: Registry,
    active_clients: IntGauge,
}

impl HubMetrics {
    pub fn new() -> HubResult<Self> {
        let registry = Registry::new();
        let active_clients = IntGauge::new("active_clients_total", "The total number of active clients")
            .map_err(|e| HubError::Other(format!("metric creation failed: {e}")))?;
        registry
            .register(Box::new(active_clients.clone()))
            .map_err(|e| HubError::Other(format!("metric registration failed: {e}")))?;
        Ok(Self {
            registry,
            active_clients,
        })
    }

    /// Current number of registered connections.
    pub fn active_clients(&self) -> i64 {
        self.active_clients.get()
    }

    pub(crate) fn client_registered(&self) {
        self.active_clients.inc();
    }

    pub(crate) fn client_unregistered(&self) {
        self.active_clients.dec();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> HubResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| HubError::Other(format!("metrics encode failed: {e}")))?;
        String::from_utf8(buf).map_err(|e| HubError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_registrations() {
        let metrics = HubMetrics::new().unwrap();
        metrics.client_registered();
        metrics.client_registered();
        metrics.client_unregistered();
        assert_eq!(metrics.active_clients(), 1);
    }

    #[test]
    fn text_export_names_gauge() {
        let metrics = HubMetrics::new().unwrap();
        metrics.client_registered();
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("active_clients_total 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = HubMetrics::new().unwrap();
        let b = HubMetrics::new().unwrap();
        a.client_registered();
        assert_eq!(b.active_clients(), 0);
    }
}
