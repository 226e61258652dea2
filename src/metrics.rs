//! Metrics and tracing instrumentation.
//!
//! With the `metrics` feature, [`METRICS`] holds OpenTelemetry instruments
//! exported through a Prometheus registry; [`render`] returns the text
//! exposition for a `/metrics` endpoint. With the `tracing` feature,
//! [`tracing_helpers`] builds the spans used around connect, probe, schema
//! setup, migrations, transactions and individual statements.

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{render, LifebuoyMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider};
    use opentelemetry::{global, KeyValue};
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<LifebuoyMetrics> = Lazy::new(LifebuoyMetrics::init);

    pub struct LifebuoyMetrics {
        registry: Registry,
        _provider: Option<SdkMeterProvider>,
        queries_total: Counter<u64>,
        query_errors_total: Counter<u64>,
        query_duration: Histogram<f64>,
        connect_duration: Histogram<f64>,
        probes_total: Counter<u64>,
        transactions_total: Counter<u64>,
        migrations_total: Counter<u64>,
        migration_duration: Histogram<f64>,
    }

    impl LifebuoyMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let (meter, provider) = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => {
                    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                    (provider.meter("lifebuoy"), Some(provider))
                }
                Err(e) => {
                    log::warn!("Prometheus exporter unavailable, metrics will not be exported: {e}");
                    (global::meter("lifebuoy"), None)
                }
            };

            Self::with_meter(&meter, registry, provider)
        }

        fn with_meter(meter: &Meter, registry: Registry, provider: Option<SdkMeterProvider>) -> Self {
            let queries_total = meter
                .u64_counter("lifebuoy_queries")
                .with_description("Total statements executed")
                .build();

            let query_errors_total = meter
                .u64_counter("lifebuoy_query_errors")
                .with_description("Statements that returned an error")
                .build();

            let query_duration = meter
                .f64_histogram("lifebuoy_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let connect_duration = meter
                .f64_histogram("lifebuoy_connect_duration_seconds")
                .with_description("Time to open the database session")
                .build();

            let probes_total = meter
                .u64_counter("lifebuoy_probes")
                .with_description("Liveness probes by outcome")
                .build();

            let transactions_total = meter
                .u64_counter("lifebuoy_transactions")
                .with_description("Transaction scopes by outcome")
                .build();

            let migrations_total = meter
                .u64_counter("lifebuoy_migrations")
                .with_description("Migration units run, by direction and outcome")
                .build();

            let migration_duration = meter
                .f64_histogram("lifebuoy_migration_duration_seconds")
                .with_description("Duration of migration units")
                .build();

            Self {
                registry,
                _provider: provider,
                queries_total,
                query_errors_total,
                query_duration,
                connect_duration,
                probes_total,
                transactions_total,
                migrations_total,
                migration_duration,
            }
        }

        pub fn record_query(&self, elapsed: Duration, ok: bool) {
            self.queries_total.add(1, &[]);
            if !ok {
                self.query_errors_total.add(1, &[]);
            }
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_connect(&self, elapsed: Duration) {
            self.connect_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_probe(&self, outcome: &'static str) {
            self.probes_total.add(1, &[KeyValue::new("outcome", outcome)]);
        }

        pub fn record_transaction(&self, outcome: &'static str) {
            self.transactions_total.add(1, &[KeyValue::new("outcome", outcome)]);
        }

        pub fn record_migration(&self, direction: &'static str, elapsed: Duration, ok: bool) {
            let attributes = [
                KeyValue::new("direction", direction),
                KeyValue::new("outcome", if ok { "success" } else { "failure" }),
            ];
            self.migrations_total.add(1, &attributes);
            self.migration_duration.record(elapsed.as_secs_f64(), &attributes);
        }
    }

    /// Prometheus text exposition of every lifebuoy metric.
    pub fn render() -> String {
        match TextEncoder::new().encode_to_string(&METRICS.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode metrics: {e}");
                String::new()
            }
        }
    }

}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    const MAX_STATEMENT_LEN: usize = 200;

    fn truncate(statement: &str) -> &str {
        match statement.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &statement[..idx],
            None => statement,
        }
    }

    pub fn execute_query_span(query: &str) -> Span {
        debug_span!("lifebuoy.query", db.statement = %truncate(query.trim()))
    }

    pub fn connect_span(redacted_url: &str) -> Span {
        info_span!("lifebuoy.connect", db.url = %redacted_url)
    }

    pub fn probe_span() -> Span {
        debug_span!("lifebuoy.probe")
    }

    pub fn schema_span(schema: &str) -> Span {
        info_span!("lifebuoy.schema", db.schema = %schema)
    }

    pub fn migration_span(name: &str, direction: &str) -> Span {
        info_span!("lifebuoy.migration", migration.name = %name, migration.direction = %direction)
    }

    pub fn transaction_span() -> Span {
        debug_span!("lifebuoy.transaction")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_truncate_respects_char_boundaries() {
            let long = "é".repeat(MAX_STATEMENT_LEN + 10);
            assert_eq!(truncate(&long).chars().count(), MAX_STATEMENT_LEN);
            assert_eq!(truncate("SELECT 1"), "SELECT 1");
        }
    }
}
