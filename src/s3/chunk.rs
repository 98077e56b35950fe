//! Read-size bounding for streamed request bodies

use crate::s3::error::{Result, S3Error};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Upper bound on bytes handed out by a single read
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Caps every read at `chunk_size` bytes regardless of the caller's buffer.
///
/// No internal buffering: bytes go straight from the inner reader into the
/// caller's buffer, and EOF and errors pass through unchanged.
#[derive(Debug)]
pub struct BoundedChunkReader<R> {
    inner: R,
    chunk_size: usize,
}

impl<R> BoundedChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    /// A zero chunk size is treated as 1 so reads always make progress.
    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedChunkReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let limit = self.chunk_size.min(buf.remaining());
        if limit == buf.remaining() {
            return Pin::new(&mut self.inner).poll_read(cx, buf);
        }

        let window = buf.initialize_unfilled_to(limit);
        let mut bounded = ReadBuf::new(window);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut bounded))?;
        let n = bounded.filled().len();
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// Raised (inside `UnexpectedEof`) by [`ExactLengthReader`] when its source
/// ends early
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("body ended after {read} of {expected} bytes")]
pub struct ShortBody {
    pub read: u64,
    pub expected: u64,
}

impl ShortBody {
    /// Look for a short body anywhere in an error's source chain.
    ///
    /// Body errors reach the caller wrapped by whatever consumed the body
    /// (the HTTP stack, a buffering read), so the whole chain is searched.
    pub fn find<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a ShortBody> {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(short) = e.downcast_ref::<ShortBody>() {
                return Some(short);
            }
            let inner = e
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<ShortBody>());
            if inner.is_some() {
                return inner;
            }
            current = e.source();
        }
        None
    }
}

/// Yields exactly `expected` bytes from the inner reader.
///
/// Reading stops at `expected` even if the source has more. A source that
/// ends early produces `UnexpectedEof` carrying a [`ShortBody`] instead of a
/// silently short body.
#[derive(Debug)]
pub struct ExactLengthReader<R> {
    inner: R,
    remaining: u64,
    expected: u64,
}

impl<R> ExactLengthReader<R> {
    pub fn new(inner: R, expected: u64) -> Self {
        Self {
            inner,
            remaining: expected,
            expected,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactLengthReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let limit = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let window = buf.initialize_unfilled_to(limit);
        let mut bounded = ReadBuf::new(window);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut bounded))?;
        let n = bounded.filled().len();

        if n == 0 {
            let read = self.expected - self.remaining;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                ShortBody {
                    read,
                    expected: self.expected,
                },
            )));
        }

        buf.advance(n);
        self.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Drain a part body completely into memory.
///
/// Short reads are retried until EOF; a body shorter than `expected` is a
/// decode error. Bytes past `expected` are never read.
pub async fn read_exact_part<R>(reader: R, expected: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let capacity = usize::try_from(expected).map_err(|_| {
        S3Error::InvalidConfig(format!("part of {} bytes does not fit in memory", expected))
    })?;

    let mut buf = Vec::with_capacity(capacity);
    let mut limited = BoundedChunkReader::new(reader).take(expected);
    limited.read_to_end(&mut buf).await.map_err(|e| {
        let short = ShortBody::find(&e).map(|short| short.to_string());
        match short {
            Some(message) => S3Error::decode(message),
            None => S3Error::Io(e),
        }
    })?;

    if (buf.len() as u64) < expected {
        return Err(S3Error::decode(format!(
            "short body: got {} of {} bytes",
            buf.len(),
            expected
        )));
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that records the largest buffer it was offered
    struct OfferRecorder {
        data: Cursor<Vec<u8>>,
        largest_offer: usize,
    }

    impl AsyncRead for OfferRecorder {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.largest_offer = self.largest_offer.max(buf.remaining());
            Pin::new(&mut self.data).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn test_reads_never_exceed_bound() {
        let data = vec![7u8; 10_000];
        let mut reader = BoundedChunkReader::new(Cursor::new(data.clone()));

        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            sizes.push(n);
            collected.extend_from_slice(&buf[..n]);
        }

        assert!(sizes.iter().all(|&n| n <= DEFAULT_CHUNK_SIZE));
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_inner_only_sees_bounded_window() {
        let recorder = OfferRecorder {
            data: Cursor::new(vec![1u8; 9000]),
            largest_offer: 0,
        };
        let mut reader = BoundedChunkReader::with_chunk_size(recorder, 1000);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(sink.len(), 9000);
        assert_eq!(reader.into_inner().largest_offer, 1000);
    }

    #[tokio::test]
    async fn test_small_caller_buffer_passes_through() {
        let mut reader = BoundedChunkReader::new(Cursor::new(vec![2u8; 100]));
        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_exact_length_stops_at_expected() {
        let mut reader = ExactLengthReader::new(Cursor::new(b"abcdefgh".to_vec()), 5);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_exact_length_short_source_fails() {
        let mut reader = ExactLengthReader::new(Cursor::new(b"abc".to_vec()), 5);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(
            ShortBody::find(&err),
            Some(&ShortBody { read: 3, expected: 5 })
        );
    }

    #[test]
    fn test_short_body_found_through_wrapping() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, ShortBody { read: 1, expected: 2 });
        let wrapped = S3Error::from(crate::s3::TransportError::with_source("reading request body", eof));
        assert_eq!(ShortBody::find(&wrapped).map(|s| s.read), Some(1));

        let unrelated = S3Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "reset"));
        assert!(ShortBody::find(&unrelated).is_none());
    }

    #[tokio::test]
    async fn test_read_exact_part() {
        let body = read_exact_part(Cursor::new(vec![9u8; 5000]), 5000).await.unwrap();
        assert_eq!(body.len(), 5000);

        let body = read_exact_part(Cursor::new(vec![9u8; 5000]), 4000).await.unwrap();
        assert_eq!(body.len(), 4000);

        let err = read_exact_part(Cursor::new(vec![9u8; 10]), 11).await.unwrap_err();
        assert!(matches!(err, S3Error::Decode { .. }));

        let short = ExactLengthReader::new(Cursor::new(vec![9u8; 10]), 11);
        let err = read_exact_part(short, 11).await.unwrap_err();
        assert!(matches!(err, S3Error::Decode { .. }), "{err:?}");
    }
}
