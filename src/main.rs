use anyhow::{Context, Result};
use clap::Parser;
use rastro::cli::Cli;
use rastro::config::RuntimeConfig;
use rastro::dispatch::{replay, DispatchTable};
use rastro::filter::PathFilter;
use rastro::modules::hdf5::Hdf5Module;
use rastro::modules::posix::PosixModule;
use rastro::runtime::Coordinator;
use rastro::telemetry::otlp::OtlpSink;
use rastro::telemetry::{ConnectionEvent, ConnectionObserver, EventSink, FanoutSink, StreamConnector};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Load the configuration file (or defaults) and apply command-line overrides
fn load_config(args: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };

    if let Some(expr) = &args.exclude {
        let filter = PathFilter::from_expr(expr)?;
        config.exclude_system = false;
        config.exclude_prefixes = filter.prefixes().to_vec();
    }
    if let Some(rank) = args.rank {
        config.rank = rank;
    }
    if let Some(job_id) = args.job_id {
        config.job_id = job_id;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

/// Telemetry sinks requested by the configuration
///
/// Connection and exporter failures disable the affected sink and are only
/// logged; the replay always proceeds.
fn build_sinks(config: &RuntimeConfig) -> (Option<Arc<StreamConnector>>, Option<Arc<dyn EventSink>>) {
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();

    let connector = if config.telemetry.enabled {
        let observer: ConnectionObserver = Arc::new(|event: ConnectionEvent| match event {
            ConnectionEvent::Connected(addr) => tracing::info!(%addr, "telemetry connected"),
            ConnectionEvent::Rejected(reason) => tracing::warn!(%reason, "telemetry rejected"),
            ConnectionEvent::Disconnected => tracing::warn!("telemetry disconnected"),
            ConnectionEvent::Error(reason) => tracing::warn!(%reason, "telemetry error"),
        });
        let connector = Arc::new(StreamConnector::connect(&config.telemetry, Some(observer)));
        if connector.is_enabled() {
            sinks.push(connector.clone());
            Some(connector)
        } else {
            None
        }
    } else {
        None
    };

    if let Some(otlp) = &config.otlp {
        match OtlpSink::new(otlp) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => tracing::warn!(error = %e, "OTLP export disabled"),
        }
    }

    let sink: Option<Arc<dyn EventSink>> = match sinks.len() {
        0 => None,
        1 => sinks.pop(),
        _ => Some(Arc::new(FanoutSink::new(sinks))),
    };
    (connector, sink)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let output: PathBuf = args
        .output
        .clone()
        .or_else(|| config.log_path.clone())
        .context("No log destination: pass --output or set log_path in the config")?;

    let calls = File::open(&args.calls)
        .with_context(|| format!("Failed to open call stream {}", args.calls.display()))?;

    let (connector, sink) = build_sinks(&config);
    let coordinator = Coordinator::with_sink(config, sink);
    let posix = PosixModule::new(&coordinator);
    let hdf5 = Hdf5Module::new(&coordinator);
    let table = DispatchTable::standard(&posix, &hdf5);

    let stats = replay(BufReader::new(calls), &table)?;
    let log = coordinator.shutdown();

    if let Some(connector) = connector {
        connector.shutdown();
        let telemetry = connector.stats();
        tracing::debug!(
            published = telemetry.published,
            written = telemetry.written,
            dropped = telemetry.dropped,
            "telemetry flushed"
        );
    }

    log.save(&output)?;

    eprintln!(
        "rastro: replayed {} calls ({} unhandled), {} records -> {}",
        stats.calls,
        stats.unhandled,
        log.record_count(),
        output.display()
    );

    Ok(())
}
