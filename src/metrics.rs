//! Prometheus metrics and tracing spans
//!
//! Both halves are optional: `metrics` enables the OpenTelemetry instruments
//! in [`METRICS`], `tracing` enables the span constructors in
//! [`tracing_helpers`].

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<GuardMetrics> = Lazy::new(GuardMetrics::init);

    pub struct GuardMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        pub lock_acquisitions: Counter<u64>,
        pub lock_contention: Counter<u64>,
        pub scripts_applied: Counter<u64>,
        pub script_failures: Counter<u64>,
        pub script_duration: Histogram<f64>,
    }

    impl GuardMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("schemaguard");

            let lock_acquisitions = meter
                .u64_counter("schemaguard_lock_acquisitions")
                .with_description("Migration lock acquisitions")
                .build();
            let lock_contention = meter
                .u64_counter("schemaguard_lock_contention")
                .with_description("Lock attempts that found the slot held")
                .build();
            let scripts_applied = meter
                .u64_counter("schemaguard_scripts_applied")
                .with_description("Migration scripts applied")
                .build();
            let script_failures = meter
                .u64_counter("schemaguard_script_failures")
                .with_description("Migration scripts that failed and were rolled back")
                .build();
            let script_duration = meter
                .f64_histogram("schemaguard_script_duration_seconds")
                .with_description("Time to execute and record one script")
                .build();

            Self {
                registry,
                _provider: provider,
                lock_acquisitions,
                lock_contention,
                scripts_applied,
                script_failures,
                script_duration,
            }
        }

        pub fn record_lock_acquired(&self) {
            self.lock_acquisitions.add(1, &[]);
        }

        pub fn record_lock_contention(&self) {
            self.lock_contention.add(1, &[]);
        }

        pub fn record_script_applied(&self, elapsed: Duration) {
            self.scripts_applied.add(1, &[]);
            self.script_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_script_failed(&self) {
            self.script_failures.add(1, &[]);
        }
    }

    /// Prometheus text exposition of every instrument
    pub fn render_metrics() -> Result<String, prometheus::Error> {
        let families = METRICS.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

}

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{render_metrics, GuardMetrics, METRICS};

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use crate::transaction::IsolationLevel;
    use tracing::{debug_span, info_span, Span};

    pub fn acquire_connection_span() -> Span {
        debug_span!("schemaguard.connect")
    }

    pub fn begin_transaction_span(isolation_level: IsolationLevel) -> Span {
        debug_span!("schemaguard.transaction.begin", isolation = isolation_level.to_sql())
    }

    pub fn commit_transaction_span() -> Span {
        debug_span!("schemaguard.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        debug_span!("schemaguard.transaction.rollback")
    }

    pub fn execute_batch_span(sql: &str) -> Span {
        debug_span!("schemaguard.execute_batch", bytes = sql.len())
    }

    pub fn lock_attempt_span(instance_id: &str) -> Span {
        info_span!("schemaguard.lock.try_acquire", instance_id = %instance_id)
    }

    pub fn apply_script_span(script: &str) -> Span {
        info_span!("schemaguard.migration.apply", script = %script)
    }
}
