use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::{
    net,
    tunnel::{
        control,
        dial::{self, ProxySource},
        error::TunnelError,
        relay::{self, InboundHook, RelayTarget},
        secure::{AuthMethod, Console, HandshakeParams, HostKey, RemoteListener, SecureConnector, SecureSession},
    },
};

/// Out-of-band notification for callers that prefer a channel over the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Reconnect,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// Shutdown was requested before or while the tunnel was up.
    Completed,
    /// The attempt ended for a transient reason; establish a new one.
    RecoverableFailure(TunnelError),
    /// Misconfiguration or an identity/protocol violation; do not retry.
    FatalFailure(TunnelError),
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::RecoverableFailure(_) => "recoverable",
            SessionOutcome::FatalFailure(_) => "fatal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub target_dial: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(15),
            target_dial: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct SessionConfig {
    pub relay_addr: String,
    pub proxy: ProxySource,
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKey,
    pub remote_host: String,
    pub remote_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub hook: Option<Arc<dyn InboundHook>>,
    pub hide_banner: bool,
    pub control_command: Option<String>,
    pub console: Arc<dyn Console>,
    pub timeouts: Timeouts,
    pub events: Option<mpsc::UnboundedSender<LifecycleSignal>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("relay_addr", &self.relay_addr)
            .field("proxy", &self.proxy)
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("host_key", &self.host_key.short())
            .field("remote", &net::join_host_port(&self.remote_host, self.remote_port))
            .field("target", &net::join_host_port(&self.target_host, self.target_port))
            .field("hook", &self.hook.is_some())
            .field("hide_banner", &self.hide_banner)
            .finish_non_exhaustive()
    }
}

/// Runs exactly one tunnel session attempt and reports how it ended.
///
/// A [`LifecycleSignal::Reconnect`] is pushed to `cfg.events` exactly once when
/// the outcome is recoverable. There is no retry here; callers own backoff.
pub async fn run_session(
    cfg: &SessionConfig,
    connector: &dyn SecureConnector,
    shutdown: watch::Receiver<bool>,
) -> SessionOutcome {
    let outcome = match attempt(cfg, connector, shutdown).await {
        Ok(()) => SessionOutcome::Completed,
        Err(err) if err.is_recoverable() => SessionOutcome::RecoverableFailure(err),
        Err(err) => SessionOutcome::FatalFailure(err),
    };

    metrics::counter!("rift_sessions_total", "outcome" => outcome.as_str()).increment(1);
    match &outcome {
        SessionOutcome::Completed => {
            tracing::info!(relay = %cfg.relay_addr, "tunnel: session closed");
        }
        SessionOutcome::RecoverableFailure(err) => {
            tracing::error!(relay = %cfg.relay_addr, err = %err, "tunnel: session ended; reconnect requested");
            metrics::counter!("rift_reconnect_signals_total").increment(1);
            if let Some(tx) = &cfg.events {
                let _ = tx.send(LifecycleSignal::Reconnect);
            }
        }
        SessionOutcome::FatalFailure(err) => {
            tracing::error!(relay = %cfg.relay_addr, err = %err, "tunnel: session failed");
        }
    }
    outcome
}

async fn attempt(
    cfg: &SessionConfig,
    connector: &dyn SecureConnector,
    shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let sess = tokio::select! {
        res = connect(cfg, connector) => res?,
        _ = wait_shutdown(shutdown.clone()) => {
            tracing::info!(relay = %cfg.relay_addr, "tunnel: shutdown before session was established");
            return Ok(());
        }
    };

    let res = serve(cfg, sess.as_ref(), shutdown).await;
    sess.close().await;
    res
}

/// Dials the relay and completes the secure handshake.
async fn connect(
    cfg: &SessionConfig,
    connector: &dyn SecureConnector,
) -> Result<Arc<dyn SecureSession>, TunnelError> {
    let proxy = cfg.proxy.resolve()?;
    let stream = dial::dial_relay(&cfg.relay_addr, proxy.as_ref(), cfg.timeouts.connect).await?;

    let params = HandshakeParams {
        relay_addr: cfg.relay_addr.clone(),
        user: cfg.user.clone(),
        auth: cfg.auth.clone(),
        host_key: cfg.host_key.clone(),
        hide_banner: cfg.hide_banner,
        console: cfg.console.clone(),
    };
    let establish = connector.establish(stream, params);
    let sess = if cfg.timeouts.handshake > Duration::from_millis(0) {
        tokio::time::timeout(cfg.timeouts.handshake, establish)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(cfg.timeouts.handshake))??
    } else {
        establish.await?
    };

    tracing::info!(
        relay = %cfg.relay_addr,
        secure = connector.name(),
        via_proxy = proxy.is_some(),
        user = %cfg.user,
        "tunnel: connected"
    );
    Ok(sess)
}

async fn serve(
    cfg: &SessionConfig,
    sess: &dyn SecureSession,
    shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let control = sess.open_control(cfg.control_command.as_deref()).await?;
    let listener = sess.listen(&cfg.remote_host, cfg.remote_port).await?;

    tracing::info!(
        remote = %net::join_host_port(&cfg.remote_host, listener.bound_port()),
        target = %net::join_host_port(&cfg.target_host, cfg.target_port),
        "tunnel: remote listener active"
    );

    let target = RelayTarget {
        addr: net::join_host_port(&cfg.target_host, cfg.target_port),
        dial_timeout: cfg.timeouts.target_dial,
        hook: cfg.hook.clone(),
    };

    // Whichever side ends first decides the outcome; the loser is dropped here
    // and the listener/session teardown below unblocks anything left behind.
    let res = tokio::select! {
        err = control::read_control_output(control, cfg.console.as_ref()) => Err(err),
        err = accept_loop(listener.as_ref(), &target) => Err(err),
        _ = wait_shutdown(shutdown) => Ok(()),
    };

    listener.close().await;
    res
}

async fn accept_loop(listener: &dyn RemoteListener, target: &RelayTarget) -> TunnelError {
    loop {
        match listener.accept().await {
            Ok(inbound) => relay::spawn_inbound(inbound, target.clone()),
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: failed to accept connection");
                return err;
            }
        }
    }
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone: nobody can ask for shutdown anymore.
            std::future::pending::<()>().await;
        }
    }
}
