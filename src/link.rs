//! Shared access to a control connection.
//!
//! The control socket carries protocol messages and raw payload with no
//! framing between them. Writers serialize through [`ControlLink::send`], one
//! whole message or chunk at a time. Exactly one task owns the
//! [`ControlReader`]; whatever it does not consume as a signal is handed to
//! whichever attached session is waiting for data, or discarded when no
//! session is attached.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::TunnelError,
    protocol::{self, Message},
};

pub const BUFFER_SIZE: usize = 8192;

/// Splits a control connection into its single reader and a shareable link.
pub fn split(stream: TcpStream) -> io::Result<(ControlReader, Arc<ControlLink>)> {
    let peer = stream.peer_addr()?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    let link = Arc::new(ControlLink {
        peer,
        writer: Mutex::new(writer),
        inbound: Mutex::new(rx),
        attached: AtomicUsize::new(0),
    });

    let reader = ControlReader {
        reader,
        tx,
        link: Arc::clone(&link),
    };

    Ok((reader, link))
}

#[derive(Debug)]
pub struct ControlLink {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    attached: AtomicUsize,
}

impl ControlLink {
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Writes one chunk with no other writer interleaving inside it.
    pub async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        protocol::write_message(&mut *writer, message).await
    }

    /// Closes the write side. Pending and later sends fail.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Registers a session as a consumer of inbound payload.
    ///
    /// The first session to attach discards chunks left over from sessions
    /// that have already gone.
    pub fn attach(self: &Arc<Self>) -> Attachment {
        if self.attached.fetch_add(1, Ordering::AcqRel) == 0 {
            self.discard_pending();
        }
        Attachment {
            link: Arc::clone(self),
        }
    }

    /// Attaches after discarding whatever payload is still queued. For a peer
    /// where a new session replaces the previous one.
    pub fn attach_fresh(self: &Arc<Self>) -> Attachment {
        self.discard_pending();
        self.attach()
    }

    #[must_use]
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    fn discard_pending(&self) {
        if let Ok(mut inbound) = self.inbound.try_lock() {
            let mut dropped = 0usize;
            while let Ok(chunk) = inbound.try_recv() {
                dropped += chunk.len();
            }
            if dropped > 0 {
                trace!(peer = %self.peer, bytes = dropped, "Discarded stale payload");
            }
        }
    }
}

/// A session's claim on inbound payload. Dropping it detaches the session.
#[derive(Debug)]
pub struct Attachment {
    link: Arc<ControlLink>,
}

impl Attachment {
    /// Waits for the next chunk handed over by the reader. Returns `None`
    /// once the reader is gone.
    pub async fn recv(&self) -> Option<Bytes> {
        self.link.inbound.lock().await.recv().await
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.link.attached.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.link.discard_pending();
        }
    }
}

/// Pipes bytes between `stream` and the control link until either side ends
/// or `cancel` fires. Payload for `stream` arrives through `attachment`.
pub async fn splice(
    link: &ControlLink,
    attachment: &Attachment,
    stream: TcpStream,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let (mut stream_reader, mut stream_writer) = stream.into_split();

    let stream_to_link = async {
        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            let n = stream_reader.read(&mut buffer).await?;
            if n == 0 {
                debug!(peer = %link.peer, "Relayed connection closed");
                return Ok::<(), TunnelError>(());
            }
            link.send(&buffer[..n]).await?;
        }
    };

    let link_to_stream = async {
        while let Some(chunk) = attachment.recv().await {
            stream_writer.write_all(&chunk).await?;
        }
        Ok::<(), TunnelError>(())
    };

    // Cancellation is checked first so a cancelled session never takes
    // another chunk off the link.
    tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(()),
        result = stream_to_link => result,
        result = link_to_stream => result,
    }
}

/// The only reader of a control connection.
#[derive(Debug)]
pub struct ControlReader {
    reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Bytes>,
    link: Arc<ControlLink>,
}

impl ControlReader {
    /// Reads whatever the next read call returns.
    pub async fn read_chunk(&mut self) -> Result<Bytes, TunnelError> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let n = self.reader.read(&mut buffer).await?;
        if n == 0 {
            return Err(TunnelError::ConnectionLost("closed by peer".into()));
        }
        buffer.truncate(n);
        Ok(Bytes::from(buffer))
    }

    /// Like [`read_chunk`](Self::read_chunk) but gives up after `idle` without data.
    pub async fn read_chunk_timeout(&mut self, idle: Duration) -> Result<Bytes, TunnelError> {
        timeout(idle, self.read_chunk())
            .await
            .map_err(|_| TunnelError::IdleTimeout(idle))?
    }

    /// Hands a payload chunk to an attached session, or drops it if none is attached.
    pub fn dispatch(&self, chunk: Bytes) {
        if self.link.attached() == 0 {
            trace!(peer = %self.link.peer, bytes = chunk.len(), "No session attached, dropping payload");
            return;
        }
        let _ = self.tx.send(chunk);
    }
}
