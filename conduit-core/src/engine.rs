// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Relay engine seam.
//!
//! The engine owns the relay protocol. This side only builds its
//! configuration bundle, starts it, and relays what it prints.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ConduitResult, EngineError};
use crate::process::{die_with_parent, wait_with_grace};
use crate::supervisor::SHUTDOWN_GRACE;

/// Environment variable naming the engine executable.
pub const ENGINE_ENV: &str = "CONDUIT_ENGINE";

/// Bundle file written into the data directory for the engine to read.
pub const BUNDLE_FILE_NAME: &str = "engine_config.json";

/// Engine configuration: the network config with this relay's overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineBundle {
    data_dir: PathBuf,
    settings: Map<String, Value>,
}

impl EngineBundle {
    pub fn build(config: &Config) -> Self {
        let mut settings = config.base_config.clone();
        let mut set = |key: &str, value: Value| {
            settings.insert(key.to_string(), value);
        };

        set("DataRootDirectory", Value::from(config.data_dir.to_string_lossy().into_owned()));
        set("ClientVersion", Value::from("1"));
        set("InproxyEnableProxy", Value::from(true));
        set("InproxyMaxClients", Value::from(config.max_clients.value()));
        if let Some(limit) = config.bandwidth.bytes_per_second() {
            set("InproxyLimitUpstreamBytesPerSecond", Value::from(limit));
            set("InproxyLimitDownstreamBytesPerSecond", Value::from(limit));
        }
        if let Some(key) = &config.private_key {
            set("InproxyProxySessionPrivateKey", Value::from(key.clone()));
        }
        set("DisableTunnels", Value::from(true));
        set("DisableLocalHTTPProxy", Value::from(true));
        set("DisableLocalSocksProxy", Value::from(true));
        set("EmitInproxyProxyActivity", Value::from(true));
        set("EmitDiagnosticNotices", Value::from(true));

        Self {
            data_dir: config.data_dir.clone(),
            settings,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec_pretty(&self.settings).map_err(|e| EngineError::BundleInvalid {
            reason: e.to_string(),
        })
    }
}

/// Runs a relay until it stops or `cancel` fires.
///
/// Every line the engine produces is sent on `notices`. The future must
/// drop all its senders before resolving.
pub trait RelayEngine: Send + Sync {
    fn run(
        &self,
        bundle: EngineBundle,
        notices: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ConduitResult<()>>;
}

/// An engine executable, started as `<program> --config <bundle file>`.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
    grace: Duration,
}

impl ExternalEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The engine named by the configuration.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        config
            .engine
            .as_ref()
            .map(Self::new)
            .ok_or(EngineError::NotConfigured)
    }
}

impl RelayEngine for ExternalEngine {
    fn run(
        &self,
        bundle: EngineBundle,
        notices: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ConduitResult<()>> {
        Box::pin(run_external(
            self.program.clone(),
            self.grace,
            bundle,
            notices,
            cancel,
        ))
    }
}

async fn run_external(
    program: PathBuf,
    grace: Duration,
    bundle: EngineBundle,
    notices: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> ConduitResult<()> {
    let bundle_path = bundle.data_dir().join(BUNDLE_FILE_NAME);
    let data = bundle.to_json()?;
    tokio::fs::write(&bundle_path, data)
        .await
        .map_err(|e| EngineError::BundleInvalid {
            reason: format!("{}: {}", bundle_path.display(), e),
        })?;

    // The engine stays in the caller's process group so a worker kill
    // reaches it, and dies with its parent if the worker is killed alone.
    let mut command = Command::new(&program);
    command
        .arg("--config")
        .arg(&bundle_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    die_with_parent(&mut command);
    let mut child = command
        .spawn()
        .map_err(|e| EngineError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    tracing::debug!(pid = child.id(), program = %program.display(), "Started relay engine");

    let readers = [
        child.stdout.take().map(|out| tokio::spawn(forward_lines(out, notices.clone()))),
        child.stderr.take().map(|err| tokio::spawn(forward_lines(err, notices.clone()))),
    ];
    drop(notices);

    let status = wait_with_grace(&mut child, &cancel, grace)
        .await
        .map_err(|e| EngineError::Exited {
            status: e.to_string(),
        })?;
    for reader in readers.into_iter().flatten() {
        let _ = reader.await;
    }

    if status.success() || cancel.is_cancelled() {
        Ok(())
    } else {
        Err(EngineError::Exited {
            status: status.to_string(),
        }
        .into())
    }
}

async fn forward_lines<R>(reader: R, notices: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if notices.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Engine output unreadable");
                break;
            }
        }
    }
}
