use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{self, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::addr::SyntheticAddr;

/// Size of the in-memory buffer backing each `Pipe` half. Generous enough
/// that a single `write_all` of typical proxied HTTP/TCP chunks never
/// blocks on itself; the channel still applies real backpressure once the
/// buffer fills.
const PIPE_BUFFER: usize = 64 * 1024;

/// One side of a [`Pipe`] — an in-memory full-duplex byte connection that
/// carries a labelled local and remote [`SyntheticAddr`]. The labels need
/// not correspond to anything the Intranet actually knows about; they are
/// purely informational, mirroring `net.Conn`'s `LocalAddr`/`RemoteAddr`.
pub struct PipeHalf {
    inner: DuplexStream,
    local: SyntheticAddr,
    remote: SyntheticAddr,
}

impl PipeHalf {
    pub fn local_addr(&self) -> &SyntheticAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &SyntheticAddr {
        &self.remote
    }
}

impl AsyncRead for PipeHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Two paired byte endpoints sharing one bidirectional in-memory
/// connection. Closing either side unblocks the other with end-of-stream
/// (dropping a `DuplexStream` half causes the peer's reads to observe EOF
/// and writes to fail, which is exactly this guarantee).
pub fn pipe(src: SyntheticAddr, dst: SyntheticAddr) -> (PipeHalf, PipeHalf) {
    let (a, b) = io::duplex(PIPE_BUFFER);
    let s = PipeHalf {
        inner: a,
        local: src.clone(),
        remote: dst.clone(),
    };
    let d = PipeHalf {
        inner: b,
        local: dst,
        remote: src,
    };
    (s, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn address_labels_are_swapped_across_sides() {
        let (s, d) = pipe(
            SyntheticAddr::new("from", "src"),
            SyntheticAddr::new("to", "dst"),
        );
        assert_eq!(s.local_addr(), &SyntheticAddr::new("from", "src"));
        assert_eq!(s.remote_addr(), &SyntheticAddr::new("to", "dst"));
        assert_eq!(d.local_addr(), &SyntheticAddr::new("to", "dst"));
        assert_eq!(d.remote_addr(), &SyntheticAddr::new("from", "src"));
    }

    #[tokio::test]
    async fn bytes_flow_both_directions() {
        let (mut s, mut d) = pipe(SyntheticAddr::new("a", "a"), SyntheticAddr::new("b", "b"));

        s.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        d.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        d.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn closing_one_side_unblocks_the_other_with_eof() {
        let (s, mut d) = pipe(SyntheticAddr::new("a", "a"), SyntheticAddr::new("b", "b"));
        drop(s);
        let mut buf = Vec::new();
        let n = d.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
