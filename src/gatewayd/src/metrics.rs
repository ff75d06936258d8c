// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus metrics for the gateway.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Bucket boundaries, in seconds, for SQL client run times.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Every outcome a statement can have, used to pre-populate the outcome
/// counter so that all series exist from startup.
pub const OUTCOMES: &[&str] = &[
    "ok",
    "validation",
    "io",
    "launch",
    "execution",
    "timeout",
    "backpressure",
    "cancelled",
];

/// The gateway's metrics and the registry they are registered in.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    statements: IntCounterVec,
    in_flight: IntGauge,
    duration: Histogram,
}

impl Metrics {
    pub fn register() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();
        let statements = IntCounterVec::new(
            Opts::new(
                "sqlgw_statements_total",
                "The number of statements handled, by outcome.",
            ),
            &["outcome"],
        )?;
        let in_flight = IntGauge::new(
            "sqlgw_statements_in_flight",
            "The number of statements currently holding an execution slot.",
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new(
                "sqlgw_statement_duration_seconds",
                "How long the SQL client ran for each statement.",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(statements.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        for outcome in OUTCOMES {
            statements.with_label_values(&[*outcome]);
        }
        Ok(Metrics {
            registry,
            statements,
            in_flight,
            duration,
        })
    }

    /// Records the outcome of one statement.
    pub fn record_outcome(&self, outcome: &str) {
        self.statements.with_label_values(&[outcome]).inc();
    }

    /// Records how long the SQL client ran.
    pub fn record_duration(&self, elapsed: Duration) {
        self.duration.observe(elapsed.as_secs_f64());
    }

    /// Marks a statement as in flight until the returned guard is dropped.
    pub fn in_flight(&self) -> InFlightGuard {
        self.in_flight.inc();
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Decrements the in-flight gauge on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Metrics;

    #[test]
    fn render_includes_all_series() {
        let metrics = Metrics::register().unwrap();
        metrics.record_outcome("ok");
        metrics.record_outcome("ok");
        metrics.record_outcome("timeout");
        metrics.record_duration(Duration::from_millis(300));

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"sqlgw_statements_total{outcome="ok"} 2"#), "{text}");
        assert!(text.contains(r#"sqlgw_statements_total{outcome="timeout"} 1"#));
        assert!(text.contains(r#"sqlgw_statements_total{outcome="backpressure"} 0"#));
        assert!(text.contains("sqlgw_statement_duration_seconds_count 1"));
        assert!(text.contains("sqlgw_statements_in_flight 0"));
    }

    #[test]
    fn in_flight_guard() {
        let metrics = Metrics::register().unwrap();
        let a = metrics.in_flight();
        let b = metrics.in_flight();
        assert_eq!(metrics.in_flight.get(), 2);
        drop(a);
        drop(b);
        assert_eq!(metrics.in_flight.get(), 0);
    }
}
