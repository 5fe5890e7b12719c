//! Application state management
//!
//! Author: hephaex@gmail.com

use crate::auth::interceptor::AccessInterceptor;
use crate::auth::registry::PermissionRegistry;
use crate::auth::service::IdentityService;
use authz_core::AppConfig;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Latency histogram buckets, upper bounds inclusive
#[derive(Debug, Clone, Default)]
pub struct LatencyBuckets {
    pub under_10ms: u64,
    pub ms_10_50: u64,
    pub ms_50_100: u64,
    pub ms_100_500: u64,
    pub ms_500_1000: u64,
    pub over_1s: u64,
}

impl LatencyBuckets {
    fn record(&mut self, latency_us: u64) {
        match latency_us {
            0..=10_000 => self.under_10ms += 1,
            10_001..=50_000 => self.ms_10_50 += 1,
            50_001..=100_000 => self.ms_50_100 += 1,
            100_001..=500_000 => self.ms_100_500 += 1,
            500_001..=1_000_000 => self.ms_500_1000 += 1,
            _ => self.over_1s += 1,
        }
    }
}

/// Per-endpoint request statistics
#[derive(Debug, Clone, Default)]
pub struct EndpointMetrics {
    pub status_counts: BTreeMap<u16, u64>,
    pub latency_count: u64,
    pub total_latency_us: u64,
    pub latency_buckets: LatencyBuckets,
}

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    pub service: Arc<IdentityService>,
    pub interceptor: AccessInterceptor,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
    /// Ready status
    pub is_ready: AtomicBool,
    /// Request statistics keyed by route
    pub metrics: RwLock<BTreeMap<String, EndpointMetrics>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        service: Arc<IdentityService>,
        registry: Arc<PermissionRegistry>,
    ) -> Self {
        let interceptor =
            AccessInterceptor::new(service.clone(), registry, config.auth.super_admin_role.clone());
        Self {
            config,
            service,
            interceptor,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            is_ready: AtomicBool::new(true),
            metrics: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &PermissionRegistry {
        self.interceptor.registry()
    }

    /// Increment request counter
    pub fn increment_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if service is ready
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    /// Set ready status
    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::SeqCst);
    }

    /// Record one finished request
    pub async fn record_request(&self, endpoint: String, status: u16, latency_us: u64) {
        self.increment_requests();
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(endpoint).or_default();
        *entry.status_counts.entry(status).or_default() += 1;
        entry.latency_count += 1;
        entry.total_latency_us += latency_us;
        entry.latency_buckets.record(latency_us);
    }
}
