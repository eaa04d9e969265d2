//! perf-shield CLI
//!
//! Thin wrapper over `perf-shield-core`: watch a process until interrupted, or
//! print the effective configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use perf_shield_core::config::{ShieldConfig, ShieldOverrides};
use perf_shield_core::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use perf_shield_core::sampler::SamplerOptions;
use perf_shield_core::shield::{Shield, ShieldHandle};

/// Watch a process and capture diagnostics under sustained CPU load.
#[derive(Parser, Debug)]
#[command(name = "perf-shield", version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info", env = "PERF_SHIELD_LOG_LEVEL")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, global = true, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample a process and capture a snapshot and profile when it runs hot
    Watch(WatchArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// TOML config file; unset keys keep their defaults
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    source: ConfigArgs,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,
}

#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// Process to watch (defaults to this process)
    #[arg(long)]
    pid: Option<u32>,

    /// Directory artifacts are written to
    #[arg(long, value_name = "DIR")]
    logs_path: Option<PathBuf>,

    /// Seconds a CPU profile records for
    #[arg(long, value_name = "SECS")]
    sampling_time: Option<u64>,

    /// Seconds between samples
    #[arg(long, value_name = "SECS")]
    flush_time: Option<u64>,

    /// Readings kept in history
    #[arg(long, value_name = "N")]
    cache_max_limit: Option<usize>,

    /// CPU percent both consecutive readings must exceed
    #[arg(long, value_name = "PERCENT")]
    threshold: Option<f64>,

    /// Seconds before an unfinished snapshot is abandoned
    #[arg(long, value_name = "SECS")]
    snapshot_timeout: Option<u64>,

    /// Report lifetime-average CPU instead of usage since the previous sample
    #[arg(long)]
    no_keep_history: bool,
}

impl OverrideArgs {
    fn into_overrides(self) -> ShieldOverrides {
        ShieldOverrides {
            logs_path: self.logs_path,
            sampling_time: self.sampling_time,
            flush_time: self.flush_time,
            cache_max_limit: self.cache_max_limit,
            cpu_usage_options: self
                .no_keep_history
                .then_some(SamplerOptions { keep_history: false }),
            cpu_threshold: self.threshold,
            snapshot_timeout: self.snapshot_timeout,
            pid: self.pid,
        }
    }
}

impl ConfigArgs {
    /// File (or defaults) merged with command-line overrides, validated.
    fn effective(self) -> Result<ShieldConfig> {
        let base = match &self.config {
            Some(path) => ShieldConfig::load_from(path).map_err(perf_shield_core::Error::from)?,
            None => ShieldConfig::default(),
        };
        let config = base.merged(self.overrides.into_overrides());
        config.validate().map_err(perf_shield_core::Error::from)?;
        Ok(config)
    }
}

fn print_config(args: ConfigArgs) -> Result<()> {
    let config = args.effective()?;
    let rendered = config.to_toml().map_err(perf_shield_core::Error::from)?;
    print!("{rendered}");
    Ok(())
}

async fn watch(args: WatchArgs) -> Result<()> {
    let config = args.source.effective()?;
    let drain_limit = config
        .sampling_duration()
        .saturating_add(config.snapshot_deadline());
    let shield = Shield::builder().config(config).build()?;
    info!(pid = shield.pid(), "Watching process");
    let handle = shield.spawn();

    match args.run_for {
        Some(secs) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl-C")?,
                () = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?,
    }

    info!("Stopping shield");
    handle.signal_shutdown();
    drain_capture(&handle, drain_limit).await;
    let stats = handle.stats();
    handle.join().await;

    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

/// Let an in-flight capture finish so its artifacts are not lost on exit.
async fn drain_capture(handle: &ShieldHandle, limit: Duration) {
    if !handle.is_capturing() {
        return;
    }
    info!(limit_secs = limit.as_secs(), "Waiting for in-flight capture");
    let wait = async {
        while handle.is_capturing() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(limit, wait).await.is_err() {
        warn!("Capture still running at exit; its artifacts may be incomplete");
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_logging(&LogConfig {
        level: cli.log_level.as_str().to_string(),
        format: cli.log_format,
        file: cli.log_file,
    })
    .map_err(perf_shield_core::Error::from)?;

    match cli.command {
        Command::Watch(args) => watch(args).await,
        Command::Config(args) => print_config(args),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(hint) = err
                .downcast_ref::<perf_shield_core::Error>()
                .and_then(perf_shield_core::Error::remediation)
            {
                eprintln!();
                eprint!("{}", hint.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_map_flags() {
        let cli = Cli::parse_from([
            "perf-shield",
            "watch",
            "--pid",
            "42",
            "--flush-time",
            "5",
            "--threshold",
            "80",
            "--no-keep-history",
        ]);
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        let overrides = args.source.overrides.into_overrides();
        assert_eq!(overrides.pid, Some(42));
        assert_eq!(overrides.flush_time, Some(5));
        assert_eq!(overrides.cpu_threshold, Some(80.0));
        assert_eq!(
            overrides.cpu_usage_options,
            Some(SamplerOptions { keep_history: false })
        );
        assert!(overrides.sampling_time.is_none());
    }

    #[test]
    fn keep_history_is_untouched_by_default() {
        let overrides = OverrideArgs::default().into_overrides();
        assert_eq!(overrides, ShieldOverrides::default());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from(["perf-shield", "config", "--log-format", "json", "--log-level", "debug"]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }
}
