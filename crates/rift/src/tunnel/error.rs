use std::{io, time::Duration};

/// Whether a failed session attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "recoverable"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("proxy io: {0}")]
    Io(#[from] io::Error),
    #[error("proxy closed the connection before the response head ended")]
    UnexpectedEof,
    #[error("proxy response head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("malformed proxy response: {0:?}")]
    Malformed(String),
    #[error("proxy refused CONNECT: {status} {reason}")]
    Refused { status: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("invalid host key: {0}")]
    InvalidHostKey(String),
    #[error("host key mismatch for {relay}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        relay: String,
        expected: String,
        actual: String,
    },
    #[error("handshake io: {0}")]
    HandshakeIo(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("authentication rejected for user {user:?}")]
    AuthRejected { user: String },
    #[error("load auth key {path}: {reason}")]
    AuthKey { path: String, reason: String },
    #[error("open control channel: {0}")]
    ControlOpen(String),
    #[error("control channel closed by relay")]
    ControlClosed,
    #[error("control channel read: {0}")]
    ControlRead(#[source] io::Error),
    #[error("remote listen {addr}: {reason}")]
    Listen { addr: String, reason: String },
    #[error("accept: {0}")]
    Accept(String),
}

impl TunnelError {
    pub fn severity(&self) -> Severity {
        match self {
            TunnelError::Connect { .. }
            | TunnelError::HandshakeIo(_)
            | TunnelError::HandshakeTimeout(_)
            | TunnelError::AuthRejected { .. }
            | TunnelError::ControlClosed
            | TunnelError::Accept(_) => Severity::Recoverable,
            TunnelError::Proxy(_)
            | TunnelError::InvalidHostKey(_)
            | TunnelError::HostKeyMismatch { .. }
            | TunnelError::Handshake(_)
            | TunnelError::AuthKey { .. }
            | TunnelError::ControlOpen(_)
            | TunnelError::ControlRead(_)
            | TunnelError::Listen { .. } => Severity::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_recoverable() {
        let err = TunnelError::Connect {
            addr: "relay.example:22".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_recoverable());
        assert!(TunnelError::ControlClosed.is_recoverable());
        assert!(TunnelError::Accept("listener closed".into()).is_recoverable());
    }

    #[test]
    fn identity_and_proxy_failures_are_fatal() {
        let mismatch = TunnelError::HostKeyMismatch {
            relay: "relay.example:22".into(),
            expected: "ssh-ed25519 AAAA".into(),
            actual: "ssh-ed25519 BBBB".into(),
        };
        assert_eq!(mismatch.severity(), Severity::Fatal);

        let refused = TunnelError::from(ProxyError::Refused {
            status: 407,
            reason: "Proxy Authentication Required".into(),
        });
        assert_eq!(refused.severity(), Severity::Fatal);
        assert!(refused.to_string().contains("407"));
    }
}
