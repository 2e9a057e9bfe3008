//! `AsyncRead`/`AsyncWrite` adapter over a [`StreamConnection`]
//!
//! Lets a tunneled stream be used anywhere tokio I/O is expected, e.g.
//! `tokio::io::copy_bidirectional` against a local TCP socket.
//!
//! The protocol has no half-close: `poll_shutdown` closes the whole stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{StreamConnection, TunnelError};

const READ_CHUNK: usize = 64 * 1024;

/// Tokio I/O view of one tunneled stream
pub struct TunnelStream {
    conn: Arc<StreamConnection>,
    pending: Bytes,
    read_fut: Option<BoxFuture<'static, Result<Bytes, TunnelError>>>,
    write_fut: Option<BoxFuture<'static, Result<usize, TunnelError>>>,
    shutdown_fut: Option<BoxFuture<'static, ()>>,
}

impl TunnelStream {
    /// Wrap a stream connection
    pub fn new(conn: Arc<StreamConnection>) -> Self {
        Self {
            conn,
            pending: Bytes::new(),
            read_fut: None,
            write_fut: None,
            shutdown_fut: None,
        }
    }

    /// The underlying stream connection
    pub fn connection(&self) -> &Arc<StreamConnection> {
        &self.conn
    }

    /// Close the stream and tell the remote end
    pub async fn close(&self) {
        self.conn.close().await;
    }

    fn poll_write_fut(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        match self.write_fut.as_mut() {
            None => Poll::Ready(Ok(0)),
            Some(fut) => {
                let result = futures::ready!(fut.poll_unpin(cx));
                self.write_fut = None;
                Poll::Ready(result.map_err(io::Error::from))
            }
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn", &self.conn)
            .finish()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            let fut = this.read_fut.get_or_insert_with(|| {
                let conn = this.conn.clone();
                async move { conn.read_chunk(READ_CHUNK).await }.boxed()
            });
            let result = futures::ready!(fut.poll_unpin(cx));
            this.read_fut = None;
            match result {
                Ok(chunk) => this.pending = chunk,
                Err(TunnelError::Eof) => return Poll::Ready(Ok(())),
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fut.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let conn = this.conn.clone();
            let data = Bytes::copy_from_slice(buf);
            this.write_fut = Some(async move { conn.write(data).await }.boxed());
        }
        this.poll_write_fut(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_write_fut(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // An in-flight write finishes first; its error does not stop the close.
        let _ = futures::ready!(this.poll_write_fut(cx));
        let fut = this.shutdown_fut.get_or_insert_with(|| {
            let conn = this.conn.clone();
            async move { conn.close().await }.boxed()
        });
        futures::ready!(fut.poll_unpin(cx));
        this.shutdown_fut = None;
        Poll::Ready(Ok(()))
    }
}
