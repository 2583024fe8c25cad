// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `conduit start` command - Run the relay.
//!
//! One instance runs the relay engine in-process. More than one re-invokes
//! this executable per instance and supervises the children.

use std::path::PathBuf;

use clap::Args;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use conduit_core::{
    Config, ConfigLoader, ExternalEngine, MultiService, Options, RelayService,
};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Maximum concurrent clients (1-1000, default 50)
    #[arg(short = 'm', long)]
    pub max_clients: Option<i64>,

    /// Total bandwidth limit in Mbps (-1 for unlimited, default 40)
    #[arg(short = 'b', long, allow_negative_numbers = true)]
    pub bandwidth: Option<f64>,

    /// Psiphon network config file (JSON)
    #[arg(short = 'c', long = "psiphon-config")]
    pub psiphon_config: Option<PathBuf>,

    /// Write stats JSON here (relative paths land in the data directory)
    #[arg(short = 's', long, num_args = 0..=1, default_missing_value = "stats.json")]
    pub stats_file: Option<PathBuf>,

    /// Override the number of supervised instances
    #[arg(long)]
    pub instances: Option<usize>,

    /// Relay engine executable
    #[arg(long, env = "CONDUIT_ENGINE")]
    pub engine: Option<PathBuf>,

    /// Leave the per-instance breakdown out of the stats file
    #[arg(long)]
    pub no_instance_stats: bool,
}

impl StartArgs {
    fn into_options(self, data_dir: Option<PathBuf>, verbosity: u8) -> Options {
        Options {
            data_dir,
            psiphon_config: self.psiphon_config,
            max_clients: self.max_clients,
            bandwidth_mbps: self.bandwidth,
            verbosity,
            stats_file: self.stats_file,
            per_instance_stats: !self.no_instance_stats,
            instances: self.instances,
            engine: self.engine,
        }
    }
}

pub async fn execute(
    args: StartArgs,
    data_dir: Option<PathBuf>,
    verbosity: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    // Fail fast on invalid flags or config before anything is spawned
    let config = ConfigLoader::resolve(args.into_options(data_dir, verbosity))?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        instances = config.instances,
        max_clients = %config.max_clients,
        bandwidth = %config.bandwidth,
        "Configuration validated successfully"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let result = if config.instances > 1 {
        run_multi(config, cancel).await
    } else {
        run_single(config, cancel).await
    };

    println!("Stopped.");
    result
}

async fn run_single(config: Config, cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let engine = ExternalEngine::from_config(&config)?;
    let stats = RelayService::new(config).run(&engine, cancel).await?;
    tracing::debug!(
        connected = stats.connected,
        bytes_up = stats.bytes_up,
        bytes_down = stats.bytes_down,
        "Relay finished"
    );
    Ok(())
}

async fn run_multi(config: Config, cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let executable = std::env::current_exe()?;
    let service = MultiService::new(config).with_cancellation(cancel.clone());

    let stop = service.stop_handle();
    tokio::spawn(async move {
        cancel.cancelled().await;
        stop.stop().await;
    });

    let snapshot = service.run_processes(executable).await?;
    tracing::debug!(
        live = snapshot.live_instances,
        restarts = snapshot.total_restarts,
        "All instances finished"
    );
    Ok(())
}

/// Cancel on the first SIGINT or SIGTERM. Later signals are ignored.
async fn watch_signals(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            shut_down(&cancel);
            return;
        }
    };

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    terminate.recv().await;
                }
            }
            _ = terminate.recv() => {}
        }
        shut_down(&cancel);
    }
}

fn shut_down(cancel: &CancellationToken) {
    if !cancel.is_cancelled() {
        println!("\nShutting down...");
        tracing::info!("Shutting down");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn start_args(argv: &[&str]) -> StartArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Start(args) => args,
        }
    }

    #[test]
    fn test_worker_invocation_parses() {
        let args = start_args(&[
            "conduit", "start", "--data-dir", "/d/0", "-m", "25", "-b", "-1", "-c", "/etc/p.json",
            "-v", "--instances", "1",
        ]);
        assert_eq!(args.max_clients, Some(25));
        assert_eq!(args.bandwidth, Some(-1.0));
        assert_eq!(args.psiphon_config, Some(PathBuf::from("/etc/p.json")));
        assert_eq!(args.instances, Some(1));
    }

    #[test]
    fn test_stats_flag_without_value() {
        let args = start_args(&["conduit", "start", "-s"]);
        assert_eq!(args.stats_file, Some(PathBuf::from("stats.json")));

        let args = start_args(&["conduit", "start", "-s", "/tmp/out.json"]);
        assert_eq!(args.stats_file, Some(PathBuf::from("/tmp/out.json")));

        let args = start_args(&["conduit", "start"]);
        assert!(args.stats_file.is_none());
    }

    #[test]
    fn test_options_mapping() {
        let args = start_args(&["conduit", "start", "--no-instance-stats", "-b", "12.5"]);
        let options = args.into_options(Some(PathBuf::from("/d")), 2);
        assert!(!options.per_instance_stats);
        assert_eq!(options.bandwidth_mbps, Some(12.5));
        assert_eq!(options.verbosity, 2);
        assert_eq!(options.data_dir, Some(PathBuf::from("/d")));
    }
}
