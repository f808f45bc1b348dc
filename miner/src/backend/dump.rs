//! Transport wrapper that logs every byte crossing it.

use log::debug;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps a stream and, when enabled, logs reads and writes as hex.
pub struct DumpStream<S> {
    inner: S,
    label: String,
    enabled: bool,
}

impl<S> DumpStream<S> {
    pub fn new(inner: S, label: impl Into<String>, enabled: bool) -> Self {
        Self {
            inner,
            label: label.into(),
            enabled,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DumpStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if this.enabled {
            if let Poll::Ready(Ok(())) = &result {
                let read = &buf.filled()[before..];
                if !read.is_empty() {
                    debug!("{} << {}", this.label, hex::encode(read));
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DumpStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if this.enabled {
            if let Poll::Ready(Ok(n)) = &result {
                debug!("{} >> {}", this.label, hex::encode(&buf[..*n]));
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = DumpStream::new(client, "test", true);
        let mut server = DumpStream::new(server, "peer", false);

        client.write_all(b"LOGIN a b\n").await.unwrap();
        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"LOGIN a b\n");

        server.write_all(b"MSG hi\n").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"MSG hi\n");
    }
}
