use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToBackend => write!(f, "client->backend"),
            Self::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Single-direction forwarding state.
pub struct StreamPump<R, W> {
    pub direction: Direction,
    /// Source to read from.
    reader: R,
    /// Destination to write to.
    writer: W,

    /// Fixed-size I/O buffer reused for the life of the pump.
    buffer: Vec<u8>,
    /// Number of valid bytes currently in `buffer` (prefix).
    bytes_ready_to_send: usize,
    /// How many of those bytes have been sent so far (for partial sends).
    bytes_already_sent: usize,

    /// Idle period after which a timeout is logged; reading continues.
    idle_timeout: Option<Duration>,
    /// Flips to true once the opposite direction has ended.
    draining: watch::Receiver<bool>,
    /// Idle period allowed while draining before the pump gives up.
    linger: Duration,
    bytes_forwarded: u64,
}

impl<R, W> StreamPump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        direction: Direction,
        reader: R,
        writer: W,
        buffer_capacity: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        // a sender that is dropped right away leaves the pump never draining
        let (_, draining) = watch::channel(false);
        Self {
            direction,
            reader,
            writer,
            buffer: vec![0u8; buffer_capacity.max(1)],
            bytes_ready_to_send: 0,
            bytes_already_sent: 0,
            idle_timeout,
            draining,
            linger: Duration::ZERO,
            bytes_forwarded: 0,
        }
    }

    /// Stop the pump once `draining` is set and the source stays silent for `linger`.
    pub fn with_drain(mut self, draining: watch::Receiver<bool>, linger: Duration) -> Self {
        self.draining = draining;
        self.linger = linger;
        self
    }

    /// Forward until the source ends, then end the destination.
    ///
    /// Returns the number of bytes forwarded. Any I/O error aborts the pump;
    /// a source that lingers while draining fails with `TimedOut`.
    pub async fn run(mut self) -> io::Result<u64> {
        loop {
            let n = self.recv().await?;
            if n == 0 {
                // end -> end: propagate the half-close
                self.writer.shutdown().await?;
                return Ok(self.bytes_forwarded);
            }
            self.bytes_ready_to_send = n;
            self.bytes_already_sent = 0;

            while self.bytes_already_sent < self.bytes_ready_to_send {
                let sent = self
                    .writer
                    .write(&self.buffer[self.bytes_already_sent..self.bytes_ready_to_send])
                    .await?;
                if sent == 0 {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                self.bytes_already_sent += sent;
            }

            self.bytes_forwarded += n as u64;
            self.reset_buffer();
        }
    }

    async fn recv(&mut self) -> io::Result<usize> {
        loop {
            let draining = *self.draining.borrow_and_update();
            let limit = if draining {
                Some(self.linger)
            } else {
                self.idle_timeout
            };

            tokio::select! {
                result = self.reader.read(&mut self.buffer) => return result,
                Ok(()) = self.draining.changed(), if !draining => {}
                _ = idle(limit) => {
                    if draining {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer stayed open after the other side ended",
                        ));
                    }
                    debug!(direction = %self.direction, idle = ?limit, "socket timeout");
                }
            }
        }
    }

    /// Reset buffer after a full send.
    fn reset_buffer(&mut self) {
        self.bytes_ready_to_send = 0;
        self.bytes_already_sent = 0;
    }
}

async fn idle(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
