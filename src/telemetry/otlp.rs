//! OpenTelemetry sink for operation events
//!
//! Each [`IoEvent`] becomes one span named `io: <op>` carrying the record
//! identity and, for data operations, the accessed segment.
//!
//! # Example
//!
//! ```toml
//! [otlp]
//! endpoint = "http://localhost:4317"
//! service_name = "climate-sim"
//! ```

use super::{EventSink, IoEvent, TelemetryError};
use crate::config::OtlpConfig;
#[cfg(feature = "otlp")]
use anyhow::Result;
#[cfg(feature = "otlp")]
use opentelemetry::{
    trace::{Span, SpanKind, Status, Tracer, TracerProvider as _},
    KeyValue,
};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    trace::{BatchSpanProcessor, SdkTracerProvider as TracerProvider},
    Resource,
};

/// OTLP exporter for operation events
#[cfg(feature = "otlp")]
pub struct OtlpSink {
    _runtime: tokio::runtime::Runtime,
    provider: TracerProvider,
    tracer: opentelemetry_sdk::trace::Tracer,
}

#[cfg(feature = "otlp")]
impl OtlpSink {
    pub fn new(config: &OtlpConfig) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| anyhow::anyhow!("Failed to create Tokio runtime: {}", e))?;

        let (provider, tracer) = runtime.block_on(async {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(&config.endpoint)
                .build()?;

            let span_processor = BatchSpanProcessor::builder(exporter).build();

            let resource = Resource::builder()
                .with_service_name(config.service_name.clone())
                .build();

            let provider = TracerProvider::builder()
                .with_span_processor(span_processor)
                .with_resource(resource)
                .build();

            let tracer = provider.tracer("rastro");

            Ok::<_, anyhow::Error>((provider, tracer))
        })?;

        Ok(OtlpSink {
            _runtime: runtime,
            provider,
            tracer,
        })
    }

    fn attributes(event: &IoEvent) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new("io.module", event.module.name()),
            KeyValue::new("io.op", event.op.clone()),
            KeyValue::new("io.file", event.file.clone()),
            KeyValue::new("io.record_id", event.record_id.0 as i64),
            KeyValue::new("io.count", event.cnt),
            KeyValue::new("job.id", event.job_id as i64),
            KeyValue::new("job.rank", event.rank),
            KeyValue::new("user.id", event.uid as i64),
        ];

        if let Some(segment) = event.seg.first() {
            attributes.push(KeyValue::new("io.offset", segment.off));
            attributes.push(KeyValue::new("io.length", segment.len));
            attributes.push(KeyValue::new("io.duration_s", segment.dur));
        }
        if event.max_byte >= 0 {
            attributes.push(KeyValue::new("io.max_byte", event.max_byte));
        }
        attributes
    }
}

#[cfg(feature = "otlp")]
impl EventSink for OtlpSink {
    fn publish(&self, event: &IoEvent) -> Result<(), TelemetryError> {
        let mut span = self
            .tracer
            .span_builder(format!("io: {}", event.op))
            .with_kind(SpanKind::Internal)
            .with_attributes(Self::attributes(event))
            .start(&self.tracer);

        span.set_status(Status::Ok);
        span.end();
        Ok(())
    }
}

#[cfg(feature = "otlp")]
impl Drop for OtlpSink {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::debug!(error = %e, "OTLP provider shutdown failed");
        }
    }
}

// Stub implementation when OTLP feature is disabled
#[cfg(not(feature = "otlp"))]
pub struct OtlpSink;

#[cfg(not(feature = "otlp"))]
impl OtlpSink {
    pub fn new(_config: &OtlpConfig) -> anyhow::Result<Self> {
        anyhow::bail!("OTLP support not compiled in. Enable the 'otlp' feature.");
    }
}

#[cfg(not(feature = "otlp"))]
impl EventSink for OtlpSink {
    fn publish(&self, _event: &IoEvent) -> Result<(), TelemetryError> {
        Err(TelemetryError::Export("OTLP support not compiled in".to_string()))
    }
}
