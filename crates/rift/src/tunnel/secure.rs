use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use russh_keys::key;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::tunnel::error::TunnelError;

/// Anything a tunnel can carry bytes over: TCP sockets, proxy tunnels, SSH channels.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// A pinned relay identity: `<algorithm> <base64 key blob>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub key_base64: String,
}

impl HostKey {
    /// Parse an OpenSSH `authorized_keys`-style line (`ssh-ed25519 AAAA... comment`).
    ///
    /// The blob must decode to a public key of the named algorithm.
    pub fn parse(line: &str) -> Result<Self, TunnelError> {
        let mut parts = line.split_whitespace();
        let (Some(algorithm), Some(key_base64)) = (parts.next(), parts.next()) else {
            return Err(TunnelError::InvalidHostKey(
                "expected \"<algorithm> <base64> [comment]\"".into(),
            ));
        };
        let key = russh_keys::parse_public_key_base64(key_base64).map_err(|e| {
            TunnelError::InvalidHostKey(format!("{algorithm} key blob does not parse: {e}"))
        })?;
        let blob_type = key_type(&key);
        if blob_type != algorithm {
            return Err(TunnelError::InvalidHostKey(format!(
                "line names {algorithm} but the blob holds a {blob_type} key"
            )));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            key_base64: key_base64.to_string(),
        })
    }

    pub fn public_key(&self) -> Result<key::PublicKey, TunnelError> {
        russh_keys::parse_public_key_base64(&self.key_base64)
            .map_err(|e| TunnelError::InvalidHostKey(format!("{}: {e}", self.algorithm)))
    }

    /// Abbreviated form for logs and error messages.
    pub fn short(&self) -> String {
        let tail_start = self.key_base64.len().saturating_sub(12);
        format!("{} ...{}", self.algorithm, &self.key_base64[tail_start..])
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.key_base64)
    }
}

/// The `authorized_keys` type name for a key. RSA keys report their signature
/// hash as their name, but the blob type is always `ssh-rsa`.
pub fn key_type(key: &key::PublicKey) -> &'static str {
    match key {
        key::PublicKey::RSA { .. } => "ssh-rsa",
        other => other.name(),
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    PublicKey {
        key_file: PathBuf,
        passphrase: Option<String>,
    },
    None,
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey { key_file, .. } => f
                .debug_struct("PublicKey")
                .field("key_file", key_file)
                .finish_non_exhaustive(),
            AuthMethod::None => f.write_str("None"),
        }
    }
}

/// Where relay-provided text (handshake banner, control channel lines) ends up.
pub trait Console: Send + Sync {
    fn banner(&self, text: &str);
    fn line(&self, text: &str);
}

#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn banner(&self, text: &str) {
        print!("{text}");
    }

    fn line(&self, text: &str) {
        println!("{text}");
    }
}

#[derive(Clone)]
pub struct HandshakeParams {
    pub relay_addr: String,
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKey,
    pub hide_banner: bool,
    pub console: Arc<dyn Console>,
}

/// Builds an authenticated, encrypted session over an already-dialed byte stream.
#[async_trait]
pub trait SecureConnector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn establish(
        &self,
        stream: BoxedStream,
        params: HandshakeParams,
    ) -> Result<Arc<dyn SecureSession>, TunnelError>;
}

#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Opens the command-execution channel whose output is streamed back.
    async fn open_control(&self, command: Option<&str>) -> Result<BoxedStream, TunnelError>;
    /// Asks the relay to bind a TCP listener on its side.
    async fn listen(&self, host: &str, port: u16) -> Result<Box<dyn RemoteListener>, TunnelError>;
    async fn close(&self);
}

#[async_trait]
pub trait RemoteListener: Send + Sync {
    async fn accept(&self) -> Result<BoxedStream, TunnelError>;
    fn bound_port(&self) -> u16;
    async fn close(&self);
}
