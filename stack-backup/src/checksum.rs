//! Content hashing for artifact streams.
//!
//! `HashingWriter` sits between a producer and its sink and hashes every
//! byte the sink accepts, so checksums come out of the same pass that
//! writes the data.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;

/// SHA-256 digest rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    fn from_hasher(hasher: Sha256) -> Self {
        Checksum(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn of(data: &[u8]) -> Self {
        Checksum::from_hasher(Sha256::new_with_prefix(data))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for tables
    pub fn short(&self) -> &str {
        let end = self.0.len().min("sha256:".len() + 12);
        &self.0[..end]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writer wrapper that hashes and counts everything written through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Consume the wrapper, returning the sink, digest and byte count
    pub fn finish(self) -> (W, Checksum, u64) {
        (self.inner, Checksum::from_hasher(self.hasher), self.bytes)
    }

    fn record(&mut self, written: &[u8]) {
        self.hasher.update(written);
        self.bytes += written.len() as u64;
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.record(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.record(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
