use metrics_exporter_statsd::{StatsdBuilder, StatsdError};

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Install a global recorder that sends every metric to StatsD.
/// metrics::init_statsd("127.0.0.1", 8125, "gitaly_client")
pub fn init_statsd(statsd_host: &str, statsd_port: u16, prefix: &str) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(statsd_host, statsd_port).build(Some(prefix))?;

    ::metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    tracing::info!(host = statsd_host, port = statsd_port, prefix, "statsd recorder installed");

    Ok(())
}
