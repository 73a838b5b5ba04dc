/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Tracing setup for Covenant services. Multiple agbot instances share
//! one trace backend, so every span carries the datastore partition the
//! emitting instance owns — without it, traces from a fleet are
//! indistinguishable. Log output is JSON on stdout; OTLP span export is
//! off unless configured.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use covenant_config::TelemetryConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Sampler;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Errors from telemetry initialization.
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("otlp exporter setup failed: {0}")]
    Exporter(String),
}

/// Keeps the span pipeline alive for the process lifetime. Dropping it
/// flushes buffered spans and shuts the exporter down.
pub struct TelemetryGuard {
    provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("telemetry shutdown error: {e}");
            }
        }
    }
}

fn sampler_for(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

/// Resource attributes identifying one agbot instance in a fleet.
fn instance_resource(service_name: &str, partition: &str) -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("covenant.partition", partition.to_string()),
    ])
}

/// Install the global tracing subscriber: JSON fmt output filtered by
/// `RUST_LOG` (default `info`, with the chattier sqlx statement logging
/// capped at warn), plus an OTLP span layer when `config.enabled`.
///
/// `partition` is the datastore partition this instance owns; it is
/// stamped on every exported span.
///
/// # Errors
///
/// Returns `TelemetryError::Exporter` if the OTLP exporter cannot be
/// built (only when export is enabled).
pub fn init_telemetry(
    service_name: &str,
    partition: &str,
    config: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true);

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if !config.enabled {
        registry.init();
        return Ok(TelemetryGuard { provider: None });
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(sampler_for(config.sample_rate))
        .with_resource(instance_resource(service_name, partition))
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));
    registry.with(otel_layer).init();

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_selection() {
        assert!(matches!(sampler_for(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(1.5), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(-0.3), Sampler::AlwaysOff));
        match sampler_for(0.25) {
            Sampler::TraceIdRatioBased(r) => assert!((r - 0.25).abs() < f64::EPSILON),
            other => panic!("expected ratio sampler, got {other:?}"),
        }
    }

    #[test]
    fn test_instance_resource_carries_partition() {
        let resource = instance_resource("agbot", "p1");
        assert!(resource
            .iter()
            .any(|(k, v)| k.as_str() == "service.name" && v.as_str() == "agbot"));
        assert!(resource
            .iter()
            .any(|(k, v)| k.as_str() == "covenant.partition" && v.as_str() == "p1"));
    }

    #[test]
    fn test_guard_drop_without_provider() {
        let guard = TelemetryGuard { provider: None };
        drop(guard); // Must not panic
    }

    #[test]
    fn test_exporter_error_display() {
        let err = TelemetryError::Exporter("endpoint refused".to_string());
        assert_eq!(err.to_string(), "otlp exporter setup failed: endpoint refused");
    }
}
