use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWriteExt, split},
    net::TcpStream,
    time,
};

use crate::tunnel::secure::BoxedStream;

/// Takes full ownership of an inbound connection in place of the default
/// dial-and-relay behavior. The hook is responsible for closing the stream.
#[async_trait]
pub trait InboundHook: Send + Sync {
    async fn handle(&self, conn: BoxedStream) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct RelayTarget {
    pub addr: String,
    pub dial_timeout: Duration,
    pub hook: Option<Arc<dyn InboundHook>>,
}

/// Hands one accepted inbound stream off to its own task.
pub fn spawn_inbound(inbound: BoxedStream, target: RelayTarget) {
    metrics::counter!("rift_inbound_connections_total").increment(1);
    if let Some(hook) = target.hook.clone() {
        tokio::spawn(async move {
            if let Err(err) = hook.handle(inbound).await {
                tracing::warn!(err = %err, "tunnel: inbound hook failed");
            }
        });
        return;
    }
    tokio::spawn(async move {
        relay_to_target(inbound, &target).await;
    });
}

/// Dials the target and splices bytes both ways until either direction ends.
pub async fn relay_to_target(mut inbound: BoxedStream, target: &RelayTarget) {
    let up = match dial_target(&target.addr, target.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            metrics::counter!("rift_target_dial_failures_total").increment(1);
            tracing::warn!(target = %target.addr, err = %err, "tunnel: failed to connect to target");
            let _ = inbound.shutdown().await;
            return;
        }
    };
    tracing::debug!(target = %target.addr, "tunnel: relaying inbound connection");

    let (mut in_rd, mut in_wr) = split(inbound);
    let (mut up_rd, mut up_wr) = split(up);

    // First direction to finish wins; the other is dropped mid-copy.
    let (dir, res) = tokio::select! {
        r = tokio::io::copy(&mut in_rd, &mut up_wr) => (Direction::Inbound, r),
        r = tokio::io::copy(&mut up_rd, &mut in_wr) => (Direction::Outbound, r),
    };

    match res {
        Ok(n) => dir.record(n),
        Err(err) if is_clean_end(&err) => {}
        Err(err) => {
            tracing::warn!(target = %target.addr, direction = dir.as_str(), err = %err, "tunnel: failed to copy");
        }
    }

    let _ = up_wr.shutdown().await;
    let _ = in_wr.shutdown().await;
}

async fn dial_target(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    if timeout > Duration::from_millis(0) {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial timeout {addr}")))?
    } else {
        TcpStream::connect(addr).await
    }
}

fn is_clean_end(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound->target",
            Direction::Outbound => "target->inbound",
        }
    }

    fn record(self, bytes: u64) {
        match self {
            Direction::Inbound => metrics::counter!("rift_bytes_inbound_total").increment(bytes),
            Direction::Outbound => metrics::counter!("rift_bytes_outbound_total").increment(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::{io::AsyncReadExt, net::TcpListener};

    fn target(addr: String) -> RelayTarget {
        RelayTarget {
            addr,
            dial_timeout: Duration::from_secs(2),
            hook: None,
        }
    }

    #[tokio::test]
    async fn relays_bytes_both_ways_and_closes_target_on_inbound_close() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let backend = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut req = [0u8; 18];
            s.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"GET / HTTP/1.1\r\n\r\n");
            s.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            // Inbound side closes next; the target must observe EOF.
            let mut rest = Vec::new();
            let n = s.read_to_end(&mut rest).await.unwrap();
            assert_eq!(n, 0);
        });

        let (mut client, inbound) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move {
            relay_to_target(Box::new(inbound), &target(addr.to_string())).await;
        });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut resp = [0u8; 27];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"HTTP/1.1 204 No Content\r\n\r\n");

        drop(client);
        time::timeout(Duration::from_secs(2), backend)
            .await
            .expect("target closed")
            .unwrap();
        time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay finished")
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_target_closes_only_the_inbound_stream() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = ln.local_addr().unwrap();
        drop(ln);

        let (mut client, inbound) = tokio::io::duplex(64);
        relay_to_target(Box::new(inbound), &target(dead.to_string())).await;

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl InboundHook for CountingHook {
        async fn handle(&self, mut conn: BoxedStream) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            conn.write_all(b"hooked").await?;
            conn.shutdown().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn hook_replaces_target_dial() {
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let (mut client, inbound) = tokio::io::duplex(64);
        spawn_inbound(
            Box::new(inbound),
            RelayTarget {
                // Nothing listens here; the hook must be used instead.
                addr: "127.0.0.1:1".into(),
                dial_timeout: Duration::from_secs(1),
                hook: Some(hook.clone()),
            },
        );

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hooked");
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }
}
