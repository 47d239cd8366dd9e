//! Process-scoped bootstrap for the resilience layer
//!
//! Wires the breaker, pool, monitor and report enhancer together once per
//! process. Other subsystems (report generation, admin dashboards) reach the
//! layer only through this facade.

use crate::backend::{ClientBuilder, CompletionClient, HealthProbe};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::AiServiceConfig;
use crate::factory::{CacheStats, ServiceFactory, ServiceOptions};
use crate::fallback::{EnhancedContent, ReportEnhancer, ReportRequest};
use crate::monitor::{AlertSink, ServiceMetrics, ServiceMonitor};
use anyhow::Result;
use std::sync::Arc;

pub struct AiService {
    breaker: Arc<CircuitBreaker>,
    factory: Arc<ServiceFactory>,
    monitor: Arc<ServiceMonitor>,
    enhancer: ReportEnhancer,
}

impl AiService {
    pub fn new(
        builder: Arc<dyn ClientBuilder>,
        probe: Arc<dyn HealthProbe>,
        alerts: Arc<dyn AlertSink>,
        config: AiServiceConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let factory = Arc::new(ServiceFactory::new(
            builder,
            Arc::clone(&breaker),
            config.factory,
        ));
        let monitor = Arc::new(ServiceMonitor::new(
            probe,
            alerts,
            Arc::clone(&breaker),
            config.monitor,
        ));
        let enhancer = ReportEnhancer::new(
            Arc::clone(&factory),
            Arc::clone(&breaker),
            Arc::clone(&monitor),
            config.options,
        );
        Self {
            breaker,
            factory,
            monitor,
            enhancer,
        }
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    pub async fn create_service(
        &self,
        options: &ServiceOptions,
    ) -> Result<Arc<dyn CompletionClient>> {
        self.factory.create_service(options).await
    }

    pub async fn generate_enhanced_content(&self, request: &ReportRequest) -> EnhancedContent {
        self.enhancer.generate_enhanced_content(request).await
    }

    pub async fn metrics(&self) -> ServiceMetrics {
        self.monitor.metrics().await
    }

    pub async fn export_metrics(&self) -> Result<String> {
        self.monitor.export_metrics().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.factory.cache_stats()
    }

    pub fn clear_cache(&self, provider: Option<&str>) -> usize {
        self.factory.clear_cache(provider)
    }

    /// Administrative "retry now": force the circuit closed.
    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}
