//! Byte channel to the terminal and the single-threaded control loop.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};

use anyhow::{bail, Context};
use ecr_core::{EcrCore, OutboundAction, PaymentReceipt, WorkflowError};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::Config;

const READ_BUF_LEN: usize = 4096;

/// Duplex byte stream to the terminal (serial device or TCP relay).
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for T {}

/// How a session ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(PaymentReceipt),
    Failed(WorkflowError),
    /// Shutdown signal before the workflow finished.
    Interrupted,
}

/// Open the relay when configured, the character device otherwise.
pub async fn open(cfg: &Config) -> anyhow::Result<Box<dyn Channel>> {
    if let Some(addr) = &cfg.relay {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to relay {}", addr))?;
        stream.set_nodelay(true)?;
        info!(relay = %addr, "Connected to relay");
        return Ok(Box::new(stream));
    }
    let device = SerialDevice::open(Path::new(&cfg.device))
        .with_context(|| format!("opening {}", cfg.device))?;
    info!(device = %cfg.device, "Opened device");
    Ok(Box::new(device))
}

/// Character device opened non-blocking and polled through the reactor.
/// Dropping a pending read leaves nothing running on the descriptor.
pub struct SerialDevice {
    fd: AsyncFd<File>,
}

impl SerialDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for SerialDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| fd.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|fd| fd.get_ref().write(buf)) {
                Ok(res) => return Poll::Ready(res),
                Err(_would_block) => continue,
            }
        }
    }

    // Unbuffered: bytes are with the driver once write returns.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Drive `core` over `channel` until the workflow ends, `shutdown` resolves,
/// or the channel fails.
pub async fn run_session<C, S>(
    channel: &mut C,
    core: &mut EcrCore,
    shutdown: S,
) -> anyhow::Result<Outcome>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    S: Future<Output = anyhow::Result<()>>,
{
    tokio::pin!(shutdown);
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut last = Instant::now();

    let mut actions = core.start();
    loop {
        let finished = tokio::select! {
            r = apply(channel, actions) => r?,
            res = &mut shutdown => {
                res?;
                info!(state = ?core.state(), "Shutdown requested while writing");
                return Ok(Outcome::Interrupted);
            }
        };
        if let Some(outcome) = finished {
            return Ok(outcome);
        }

        let timeout = core.poll_timeout();
        let read = tokio::select! {
            r = channel.read(&mut buf) => Some(r),
            _ = sleep(timeout) => None,
            res = &mut shutdown => {
                res?;
                info!(state = ?core.state(), "Shutdown requested");
                return Ok(Outcome::Interrupted);
            }
        };

        actions = Vec::new();
        if let Some(r) = read {
            let n = r.context("reading from terminal")?;
            if n == 0 {
                bail!("terminal channel closed");
            }
            actions.extend(core.on_bytes_received(&buf[..n]));
        }
        let now = Instant::now();
        actions.extend(core.tick(now.duration_since(last)));
        last = now;
    }
}

/// Perform `actions` in order; returns the outcome once all bytes are written.
async fn apply<C>(channel: &mut C, actions: Vec<OutboundAction>) -> anyhow::Result<Option<Outcome>>
where
    C: AsyncWrite + Unpin + ?Sized,
{
    let mut outcome = None;
    let mut wrote = false;
    for action in actions {
        match action {
            OutboundAction::Write(bytes) => {
                trace!(len = bytes.len(), "Writing bytes");
                channel
                    .write_all(&bytes)
                    .await
                    .context("writing to terminal")?;
                wrote = true;
            }
            OutboundAction::DeliveryFailed { seq, frame_type } => {
                warn!(seq, frame_type = ?frame_type, "Message to terminal lost");
            }
            OutboundAction::Completed(receipt) => outcome = Some(Outcome::Completed(receipt)),
            OutboundAction::Failed(e) => outcome = Some(Outcome::Failed(e)),
        }
    }
    if wrote {
        channel.flush().await.context("writing to terminal")?;
    }
    if outcome.is_some() {
        debug!("Workflow finished");
    }
    Ok(outcome)
}
