use gitaly_client::config::{LoggingConfig, MetricsConfig};
use gitaly_client::metrics_defs::ALL_METRICS;
use shared::metrics::{MetricsError, init_statsd};
use shared::metrics_defs::describe_all;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the sentry client alive. Events still queued are flushed on drop.
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init_logging(logging: Option<&LoggingConfig>) -> Guard {
    let sentry = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .filter(|dsn| !dsn.is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry.as_ref().map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .init();

    Guard { _sentry: sentry }
}

pub fn init_metrics(metrics: Option<&MetricsConfig>) -> Result<(), MetricsError> {
    let Some(metrics) = metrics else {
        tracing::debug!("no metrics sink configured");
        return Ok(());
    };

    init_statsd(&metrics.statsd_host, metrics.statsd_port, &metrics.prefix)?;
    describe_all(ALL_METRICS);

    Ok(())
}
