use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::watch;

use crate::{
    config, logging, telemetry,
    tunnel::{
        secure::{SecureConnector, StdoutConsole},
        session::{self, SessionConfig, SessionOutcome},
        ssh::SshConnector,
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    telemetry::init_prometheus(cfg.metrics_addr)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        relay = %cfg.relay.addr,
        user = %cfg.relay.user,
        host_key = %cfg.relay.host_key.short(),
        remote = %crate::net::join_host_port(&cfg.remote.host, cfg.remote.port),
        target = %crate::net::join_host_port(&cfg.target.host, cfg.target.port),
        "rift: starting"
    );

    let session_cfg = cfg.session_config(Arc::new(StdoutConsole), None);
    let connector = SshConnector::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        let _ = shutdown_tx.send(true);
    });

    supervise(
        &session_cfg,
        &connector,
        Backoff::new(cfg.reconnect.initial_backoff, cfg.reconnect.max_backoff),
        shutdown_rx,
    )
    .await
}

/// Re-establishes sessions after recoverable failures until shutdown or a
/// fatal error.
async fn supervise(
    cfg: &SessionConfig,
    connector: &dyn SecureConnector,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match session::run_session(cfg, connector, shutdown.clone()).await {
            SessionOutcome::Completed => return Ok(()),
            SessionOutcome::FatalFailure(err) => {
                return Err(err).with_context(|| format!("tunnel: relay {}", cfg.relay_addr));
            }
            SessionOutcome::RecoverableFailure(err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    relay = %cfg.relay_addr,
                    err = %err,
                    backoff = %humantime::format_duration(delay),
                    "tunnel: disconnected; retrying"
                );
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Doubling reconnect delay, capped.
#[derive(Debug, Clone)]
struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
