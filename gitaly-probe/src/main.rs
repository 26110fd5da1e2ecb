use clap::{Parser, Subcommand};
use gitaly_client::config::{Config, ConfigError};
use gitaly_client::metrics_defs::ALL_METRICS;
use gitaly_client::storage::Storages;
use std::path::PathBuf;
use std::process::ExitCode;

mod init;

#[derive(Parser)]
#[command(about = "Inspect a gitaly client configuration")]
struct Cli {
    #[arg(long, default_value = "gitaly-client.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Load and validate the configuration
    Validate,
    /// Print every storage with its dial target
    Storages,
    /// Print the metrics the client emits
    Metrics,
}

#[derive(thiserror::Error, Debug)]
enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] shared::metrics::MetricsError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _guard = init::init_logging(config.logging.as_ref());

    match run(&cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gitaly-probe failed");
            ExitCode::FAILURE
        }
    }
}

fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
    let config = Config::from_file(path)?;
    config.validate()?;

    Ok(config)
}

fn run(command: &CliCommand, config: &Config) -> Result<(), ProbeError> {
    init::init_metrics(config.metrics.as_ref())?;

    match command {
        CliCommand::Validate => {
            let storages = Storages::from_config(config)?;
            tracing::info!(
                storages = storages.names().count(),
                circuit_breaker = config.circuit_breaker.enabled,
                enforce_limits = config.request_limits.enforce,
                "configuration is valid"
            );
        }
        CliCommand::Storages => {
            for line in storage_report(config)? {
                println!("{line}");
            }
        }
        CliCommand::Metrics => {
            for line in metrics_report() {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn storage_report(config: &Config) -> Result<Vec<String>, ConfigError> {
    let storages = Storages::from_config(config)?;
    let mut names: Vec<&str> = storages.names().collect();
    names.sort_unstable();

    names
        .into_iter()
        .map(|name| {
            let address = storages.address(name)?;
            let tls = if address.is_tls() { " (tls)" } else { "" };
            Ok(format!("{name}\t{}{tls}", address.target()))
        })
        .collect()
}

fn metrics_report() -> Vec<String> {
    ALL_METRICS
        .iter()
        .map(|def| {
            format!(
                "{}\t{}\t{}",
                def.name,
                def.metric_type.as_str(),
                def.description
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_parse_cli() {
        let cli = Cli::try_parse_from(["gitaly-probe", "--config", "/etc/gitaly.yaml", "storages"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/gitaly.yaml"));
        assert!(matches!(cli.command, CliCommand::Storages));

        assert!(Cli::try_parse_from(["gitaly-probe"]).is_err());
    }

    #[test]
    fn test_storage_report() {
        let tmp = write_tmp_file(
            r#"
storages:
    zeta:
        gitaly_address: "tls://gitaly-2.internal:9999"
    default:
        gitaly_address: "tcp://localhost:9876"
gitaly_token: "secret"
"#,
        );

        let config = load(tmp.path()).unwrap();
        assert_eq!(
            storage_report(&config).unwrap(),
            vec![
                "default\tlocalhost:9876".to_string(),
                "zeta\tgitaly-2.internal:9999 (tls)".to_string(),
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = write_tmp_file("storages: {}\n");
        assert!(matches!(load(tmp.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_every_command_runs_on_a_loaded_config() {
        let tmp = write_tmp_file(
            r#"
storages:
    default:
        gitaly_address: "unix:/var/run/gitaly.socket"
"#,
        );
        let config = load(tmp.path()).unwrap();

        for command in [CliCommand::Validate, CliCommand::Storages, CliCommand::Metrics] {
            run(&command, &config).unwrap();
        }

        let cli = Cli::try_parse_from(["gitaly-probe", "metrics"]).unwrap();
        assert!(matches!(cli.command, CliCommand::Metrics));
        assert!(load(&cli.config).is_err());
    }

    #[test]
    fn test_metrics_report() {
        let report = metrics_report();
        assert_eq!(report.len(), ALL_METRICS.len());
        assert!(report[0].starts_with("gitaly.call.duration\tHistogram\t"));
    }
}
