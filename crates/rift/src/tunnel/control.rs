use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::tunnel::{error::TunnelError, secure::Console};

/// Longer lines are surfaced in pieces of this size.
const MAX_CONTROL_LINE_BYTES: usize = 16 * 1024;

/// Streams relay diagnostics line by line to `console`.
///
/// Never returns `Ok`: a clean end of stream means the relay dropped the
/// control channel and yields [`TunnelError::ControlClosed`].
pub async fn read_control_output<R>(stream: R, console: &dyn Console) -> TunnelError
where
    R: AsyncRead + Unpin,
{
    let mut rd = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let mut limited = (&mut rd).take(MAX_CONTROL_LINE_BYTES as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => return TunnelError::ControlClosed,
            Ok(_) => {
                let line = trim_line_end(&buf);
                console.line(&String::from_utf8_lossy(line));
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return TunnelError::ControlClosed;
            }
            Err(err) => return TunnelError::ControlRead(err),
        }
    }
}

fn trim_line_end(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
