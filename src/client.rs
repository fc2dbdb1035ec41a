//! Echo client.
//!
//! Sends `<prefix>-<n>` messages one at a time, waits for each echo, and
//! finally waits for the server to close the connection. Every read and
//! write is bounded by the client-side readiness timeout.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default per-call timeout on the client side.
pub const CLIENT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub echoed: usize,
    /// The server closed the connection after the last echo.
    pub server_closed: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    /// No progress within the readiness timeout.
    Timeout { after: usize },
    /// The echo did not match what was sent.
    Mismatch { expected: String, got: String },
    /// The server closed before echoing message `after`.
    Closed { after: usize },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {e}"),
            ClientError::Timeout { after } => {
                write!(f, "timed out after {after} echoed messages")
            }
            ClientError::Mismatch { expected, got } => {
                write!(f, "echo mismatch: expected {expected:?}, got {got:?}")
            }
            ClientError::Closed { after } => {
                write!(f, "server closed after {after} echoed messages")
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Connect to `addr` and run the echo exchange.
pub async fn run(
    addr: &str,
    count: usize,
    prefix: &str,
    poll_timeout: Duration,
) -> Result<ClientReport, ClientError> {
    let stream = timeout(poll_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout { after: 0 })??;
    debug!(addr, "Connected");
    exchange(stream, count, prefix, poll_timeout).await
}

/// Run the echo exchange over an established stream.
pub async fn exchange<S>(
    mut stream: S,
    count: usize,
    prefix: &str,
    poll_timeout: Duration,
) -> Result<ClientReport, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut buf = vec![0u8; 1024];

    for i in 0..count {
        let message = format!("{prefix}-{i}");
        timeout(poll_timeout, stream.write_all(message.as_bytes()))
            .await
            .map_err(|_| ClientError::Timeout { after: i })??;

        let mut echoed = Vec::with_capacity(message.len());
        while echoed.len() < message.len() {
            let n = timeout(poll_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| ClientError::Timeout { after: i })??;
            if n == 0 {
                return Err(ClientError::Closed { after: i });
            }
            echoed.extend_from_slice(&buf[..n]);
        }

        if echoed != message.as_bytes() {
            return Err(ClientError::Mismatch {
                expected: message,
                got: String::from_utf8_lossy(&echoed).into_owned(),
            });
        }
        debug!(message = %message, "Echo verified");
    }

    // The server closes once its I/O target is reached.
    let server_closed = matches!(timeout(poll_timeout, stream.read(&mut buf)).await, Ok(Ok(0)));

    let report = ClientReport {
        echoed: count,
        server_closed,
        elapsed: started.elapsed(),
    };
    info!(
        echoed = report.echoed,
        server_closed = report.server_closed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Client finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_exchange_verifies_echoes() {
        let mock = Builder::new()
            .write(b"ping-0")
            .read(b"ping-0")
            .write(b"ping-1")
            .read(b"ping-")
            .read(b"1")
            .build();

        let report = exchange(mock, 2, "ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.echoed, 2);
        assert!(report.server_closed);
    }

    #[tokio::test]
    async fn test_exchange_detects_mismatch() {
        let mock = Builder::new().write(b"ping-0").read(b"pong-0").build();

        let err = exchange(mock, 1, "ping", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_exchange_detects_early_close() {
        let mock = Builder::new()
            .write(b"ping-0")
            .read(b"ping-0")
            .write(b"ping-1")
            .build();

        let err = exchange(mock, 2, "ping", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Closed { after: 1 }));
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let mock = Builder::new()
            .write(b"ping-0")
            .wait(Duration::from_millis(200))
            .build();

        let err = exchange(mock, 1, "ping", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { after: 0 }));
    }
}
