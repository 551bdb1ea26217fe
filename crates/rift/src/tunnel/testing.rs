//! In-memory relay implementing the secure-session traits, for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::{
    io::DuplexStream,
    net::TcpListener,
    sync::{mpsc, watch},
};

use crate::tunnel::{
    error::TunnelError,
    secure::{BoxedStream, HandshakeParams, HostKey, RemoteListener, SecureConnector, SecureSession},
};

pub(crate) const RELAY_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPUf9Q5yfPhOQ+rqvuDQYWBG+zI2yy/bm+8ddrywfxN0 relay@test";
pub(crate) const OTHER_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFf2op8aqo0jmdQECTkODy+8f9xJQ+C1V42C5CTlzFjV other@test";

#[derive(Default)]
pub(crate) struct RelayState {
    control: Mutex<Option<DuplexStream>>,
    inbound: Mutex<Option<mpsc::Receiver<BoxedStream>>>,
    pub listened: Mutex<Vec<(String, u16)>>,
    pub authenticated: Mutex<Vec<String>>,
    pub closed: Mutex<bool>,
}

/// Relay-side ends the test drives.
pub(crate) struct RelayHandles {
    pub control: DuplexStream,
    pub inbound: mpsc::Sender<BoxedStream>,
    pub state: Arc<RelayState>,
}

pub(crate) struct MockRelay {
    pub host_key: HostKey,
    pub banner: Option<String>,
    pub refuse_listen: bool,
    state: Arc<RelayState>,
}

impl MockRelay {
    pub fn new() -> (Self, RelayHandles) {
        let (relay_side, client_side) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(16);
        let state = Arc::new(RelayState::default());
        *state.control.lock().unwrap() = Some(client_side);
        *state.inbound.lock().unwrap() = Some(rx);

        let relay = Self {
            host_key: HostKey::parse(RELAY_KEY).expect("test key"),
            banner: None,
            refuse_listen: false,
            state: state.clone(),
        };
        (
            relay,
            RelayHandles {
                control: relay_side,
                inbound: tx,
                state,
            },
        )
    }
}

#[async_trait]
impl SecureConnector for MockRelay {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn establish(
        &self,
        _stream: BoxedStream,
        params: HandshakeParams,
    ) -> Result<Arc<dyn SecureSession>, TunnelError> {
        if params.host_key != self.host_key {
            return Err(TunnelError::HostKeyMismatch {
                relay: params.relay_addr,
                expected: params.host_key.short(),
                actual: self.host_key.short(),
            });
        }
        if let Some(b) = &self.banner {
            if !params.hide_banner {
                params.console.banner(b);
            }
        }
        self.state.authenticated.lock().unwrap().push(params.user);
        Ok(Arc::new(MockSession {
            state: self.state.clone(),
            refuse_listen: self.refuse_listen,
        }))
    }
}

struct MockSession {
    state: Arc<RelayState>,
    refuse_listen: bool,
}

#[async_trait]
impl SecureSession for MockSession {
    async fn open_control(&self, _command: Option<&str>) -> Result<BoxedStream, TunnelError> {
        let st = self.state.control.lock().unwrap().take();
        match st {
            Some(st) => Ok(Box::new(st)),
            None => Err(TunnelError::ControlOpen("control channel already taken".into())),
        }
    }

    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn RemoteListener>, TunnelError> {
        let addr = format!("{host}:{port}");
        if self.refuse_listen {
            return Err(TunnelError::Listen {
                addr,
                reason: "tcpip-forward refused".into(),
            });
        }
        let rx = self.state.inbound.lock().unwrap().take();
        let Some(rx) = rx else {
            return Err(TunnelError::Listen {
                addr,
                reason: "already listening".into(),
            });
        };
        self.state.listened.lock().unwrap().push((host.to_string(), port));
        let (closed, _) = watch::channel(false);
        Ok(Box::new(MockListener {
            rx: tokio::sync::Mutex::new(rx),
            closed,
            port,
        }))
    }

    async fn close(&self) {
        *self.state.closed.lock().unwrap() = true;
    }
}

struct MockListener {
    rx: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,
    closed: watch::Sender<bool>,
    port: u16,
}

#[async_trait]
impl RemoteListener for MockListener {
    async fn accept(&self) -> Result<BoxedStream, TunnelError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TunnelError::Accept("listener closed".into()));
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(TunnelError::Accept("listener closed".into())),
            st = rx.recv() => st.ok_or_else(|| TunnelError::Accept("relay stopped forwarding".into())),
        }
    }

    fn bound_port(&self) -> u16 {
        self.port
    }

    async fn close(&self) {
        let _ = self.closed.send(true);
    }
}

/// A TCP endpoint standing in for the relay's SSH port; it accepts and holds connections.
pub(crate) async fn spawn_relay_endpoint() -> String {
    let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = ln.local_addr().expect("relay addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((c, _)) = ln.accept().await {
            held.push(c);
        }
    });
    addr.to_string()
}
