use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use russh::{Channel, Disconnect, client};
use russh_keys::{PublicKeyBase64, key};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{Mutex, mpsc, watch},
};

use crate::tunnel::{
    error::TunnelError,
    secure::{
        AuthMethod, BoxedStream, Console, HandshakeParams, RemoteListener, SecureConnector,
        SecureSession, key_type,
    },
};

const FORWARDED_BACKLOG: usize = 64;
const FORWARDED_PIPE_BYTES: usize = 32 * 1024;

/// SSH-backed secure transport (russh).
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureConnector for SshConnector {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn establish(
        &self,
        stream: BoxedStream,
        params: HandshakeParams,
    ) -> Result<Arc<dyn SecureSession>, TunnelError> {
        let pinned = params.host_key.public_key()?;

        let rejected = Arc::new(StdMutex::new(None));
        let (tx, rx) = mpsc::channel(FORWARDED_BACKLOG);
        let handler = RelayHandler {
            relay: params.relay_addr.clone(),
            pinned,
            rejected: rejected.clone(),
            hide_banner: params.hide_banner,
            console: params.console.clone(),
            forwarded: tx,
        };

        let mut handle = match client::connect_stream(self.config.clone(), stream, handler).await {
            Ok(h) => h,
            Err(err) => {
                let actual = rejected.lock().map(|r| r.clone()).unwrap_or_default();
                if let Some(actual) = actual {
                    return Err(TunnelError::HostKeyMismatch {
                        relay: params.relay_addr,
                        expected: params.host_key.short(),
                        actual,
                    });
                }
                return Err(classify(err));
            }
        };

        if !authenticate(&mut handle, &params.user, &params.auth).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(TunnelError::AuthRejected { user: params.user });
        }

        tracing::debug!(relay = %params.relay_addr, user = %params.user, "tunnel: ssh authenticated");

        Ok(Arc::new(SshSession {
            handle: Arc::new(Mutex::new(handle)),
            forwarded: StdMutex::new(Some(rx)),
        }))
    }
}

async fn authenticate(
    handle: &mut client::Handle<RelayHandler>,
    user: &str,
    auth: &AuthMethod,
) -> Result<bool, TunnelError> {
    let res = match auth {
        AuthMethod::Password(password) => handle.authenticate_password(user, password.as_str()).await,
        AuthMethod::PublicKey {
            key_file,
            passphrase,
        } => {
            let pair = russh_keys::load_secret_key(key_file, passphrase.as_deref()).map_err(|e| {
                TunnelError::AuthKey {
                    path: key_file.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            handle.authenticate_publickey(user, Arc::new(pair)).await
        }
        AuthMethod::None => handle.authenticate_none(user).await,
    };
    res.map_err(classify)
}

/// I/O-level failures are transient; everything else is a protocol problem.
fn classify(err: russh::Error) -> TunnelError {
    match err {
        russh::Error::IO(e) => TunnelError::HandshakeIo(e.to_string()),
        russh::Error::Disconnect | russh::Error::HUP => TunnelError::HandshakeIo(err.to_string()),
        other => TunnelError::Handshake(other.to_string()),
    }
}

struct RelayHandler {
    relay: String,
    pinned: key::PublicKey,
    rejected: Arc<StdMutex<Option<String>>>,
    hide_banner: bool,
    console: Arc<dyn Console>,
    forwarded: mpsc::Sender<BoxedStream>,
}

#[async_trait]
impl client::Handler for RelayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // The blob carries the key type, so comparing blobs also pins the algorithm.
        let actual = server_public_key.public_key_base64();
        if actual == self.pinned.public_key_base64() {
            tracing::debug!(relay = %self.relay, "tunnel: relay host key verified");
            return Ok(true);
        }
        let kind = key_type(server_public_key);
        tracing::error!(relay = %self.relay, key_type = kind, "tunnel: relay host key mismatch");
        if let Ok(mut r) = self.rejected.lock() {
            *r = Some(format!("{kind} {actual}"));
        }
        Ok(false)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if !self.hide_banner {
            self.console.banner(banner);
        }
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            bound = %format!("{connected_address}:{connected_port}"),
            origin = %format!("{originator_address}:{originator_port}"),
            "tunnel: forwarded connection"
        );
        let (local, remote) = tokio::io::duplex(FORWARDED_PIPE_BYTES);
        tokio::spawn(pump_channel(channel, remote));
        // Never block the session loop; a full backlog drops the new connection,
        // which in turn closes its channel.
        if let Err(err) = self.forwarded.try_send(Box::new(local)) {
            tracing::warn!(err = %err, "tunnel: dropping forwarded connection");
        }
        Ok(())
    }
}

/// Copies between a forwarded channel and the pipe handed to the relay.
/// When either side ends, the pipe is shut down and the channel closed.
async fn pump_channel(mut channel: Channel<client::Msg>, pipe: DuplexStream) {
    let id = channel.id();
    let (mut pipe_rd, mut pipe_wr) = tokio::io::split(pipe);
    let mut ch_wr = channel.make_writer();
    {
        let mut ch_rd = channel.make_reader();
        let res = tokio::select! {
            r = tokio::io::copy(&mut ch_rd, &mut pipe_wr) => r,
            r = tokio::io::copy(&mut pipe_rd, &mut ch_wr) => r,
        };
        if let Err(err) = res {
            tracing::debug!(channel = %id, err = %err, "tunnel: forwarded channel copy");
        }
    }
    let _ = pipe_wr.shutdown().await;
    if let Err(err) = channel.close().await {
        tracing::debug!(channel = %id, err = %err, "tunnel: close forwarded channel");
    }
}

struct SshSession {
    handle: Arc<Mutex<client::Handle<RelayHandler>>>,
    forwarded: StdMutex<Option<mpsc::Receiver<BoxedStream>>>,
}

#[async_trait]
impl SecureSession for SshSession {
    async fn open_control(&self, command: Option<&str>) -> Result<BoxedStream, TunnelError> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::ControlOpen(e.to_string()))?;
        if let Some(cmd) = command {
            channel
                .exec(true, cmd)
                .await
                .map_err(|e| TunnelError::ControlOpen(format!("exec {cmd:?}: {e}")))?;
        }
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn RemoteListener>, TunnelError> {
        let addr = crate::net::join_host_port(host, port);
        let rx = self.forwarded.lock().ok().and_then(|mut f| f.take());
        let Some(rx) = rx else {
            return Err(TunnelError::Listen {
                addr,
                reason: "session already has a remote listener".into(),
            });
        };

        let bound = self
            .handle
            .lock()
            .await
            .tcpip_forward(host, u32::from(port))
            .await
            .map_err(|e| TunnelError::Listen {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let Some(bound_port) = granted_port(port, bound) else {
            return Err(TunnelError::Listen {
                addr,
                reason: format!("relay granted unusable port {bound}"),
            });
        };

        let (closed, _) = watch::channel(false);
        Ok(Box::new(SshRemoteListener {
            handle: self.handle.clone(),
            incoming: Mutex::new(rx),
            closed,
            host: host.to_string(),
            port: bound_port,
        }))
    }

    async fn close(&self) {
        let res = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        if let Err(err) = res {
            tracing::debug!(err = %err, "tunnel: ssh disconnect");
        }
    }
}

/// The relay reports the port it picked only when asked for port 0.
fn granted_port(requested: u16, granted: u32) -> Option<u16> {
    if requested != 0 {
        return Some(requested);
    }
    u16::try_from(granted).ok().filter(|p| *p != 0)
}

struct SshRemoteListener {
    handle: Arc<Mutex<client::Handle<RelayHandler>>>,
    incoming: Mutex<mpsc::Receiver<BoxedStream>>,
    closed: watch::Sender<bool>,
    host: String,
    port: u16,
}

#[async_trait]
impl RemoteListener for SshRemoteListener {
    async fn accept(&self) -> Result<BoxedStream, TunnelError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TunnelError::Accept("listener closed".into()));
        }
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(TunnelError::Accept("listener closed".into())),
            st = rx.recv() => st.ok_or_else(|| TunnelError::Accept("ssh session ended".into())),
        }
    }

    fn bound_port(&self) -> u16 {
        self.port
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let res = self
            .handle
            .lock()
            .await
            .cancel_tcpip_forward(self.host.as_str(), u32::from(self.port))
            .await;
        if let Err(err) = res {
            tracing::debug!(err = %err, "tunnel: cancel tcpip-forward");
        }
    }
}
