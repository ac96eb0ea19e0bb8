//! Bidirectional copy between two async streams
//!
//! Both directions are driven by one future. A direction finishes when its
//! reader hits EOF (the writer is then shut down, propagating the half-close)
//! or when either side fails. The copy completes once both directions have
//! finished; an error in one direction does not stop the other.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a bidirectional copy
#[derive(Debug, Default)]
pub struct CopyResult {
    /// Bytes written from `a` to `b`
    pub a_to_b: u64,
    /// Bytes written from `b` to `a`
    pub b_to_a: u64,
    /// Error that ended the `a` to `b` direction, if any
    pub a_to_b_error: Option<io::Error>,
    /// Error that ended the `b` to `a` direction, if any
    pub b_to_a_error: Option<io::Error>,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

struct Direction {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    read_done: bool,
    finished: bool,
    transferred: u64,
    error: Option<io::Error>,
}

impl Direction {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            pos: 0,
            cap: 0,
            read_done: false,
            finished: false,
            transferred: 0,
            error: None,
        }
    }

    /// Drive this direction; `Ready` once it has finished for good
    fn poll_copy<R, W>(&mut self, cx: &mut Context<'_>, mut reader: Pin<&mut R>, mut writer: Pin<&mut W>) -> Poll<()>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.finished {
            return Poll::Ready(());
        }
        match self.poll_step(cx, reader.as_mut(), writer.as_mut()) {
            Poll::Ready(result) => {
                if let Err(e) = result {
                    self.error = Some(e);
                }
                self.finished = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_step<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "write zero bytes")));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.transferred += n as u64;
                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                return writer.as_mut().poll_shutdown(cx);
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

struct BidirectionalCopy<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: Direction,
    b_to_a: Direction,
}

impl<A, B> std::future::Future for BidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = CopyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let a_to_b = this.a_to_b.poll_copy(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b));
        let b_to_a = this.b_to_a.poll_copy(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a));

        if a_to_b.is_pending() || b_to_a.is_pending() {
            return Poll::Pending;
        }

        Poll::Ready(CopyResult {
            a_to_b: this.a_to_b.transferred,
            b_to_a: this.b_to_a.transferred,
            a_to_b_error: this.a_to_b.error.take(),
            b_to_a_error: this.b_to_a.error.take(),
        })
    }
}

/// Copy data between `a` and `b` in both directions until both finish
pub async fn bidirectional_copy<A, B>(a: &mut A, b: &mut B) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    bidirectional_copy_with_buffer(a, b, DEFAULT_BUFFER_SIZE).await
}

/// Same as [`bidirectional_copy`] with a custom per-direction buffer size
pub async fn bidirectional_copy_with_buffer<A, B>(a: &mut A, b: &mut B, buf_size: usize) -> CopyResult
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    BidirectionalCopy {
        a,
        b,
        a_to_b: Direction::new(buf_size),
        b_to_a: Direction::new(buf_size),
    }
    .await
}
