//! Cancellation helpers.

use crate::{Error, Result};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Run `fut` unless `token` fires first, in which case the future is dropped
/// and [`Error::Cancelled`] is returned.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Fail with [`Error::Cancelled`] if `token` has fired.
pub fn check(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Async reader or writer that fails every pending operation once the token
/// fires, so a stalled transfer is abandoned instead of waited on.
///
/// The inner stream is handed back by [`CancelIo::into_inner`] so it can
/// still be closed or aborted.
pub struct CancelIo<T> {
    inner: T,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> CancelIo<T> {
    pub fn new(inner: T, token: &CancellationToken) -> Self {
        Self {
            inner,
            token: token.clone(),
            cancelled: Box::pin(token.clone().cancelled_owned()),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Ready with an error once cancelled; otherwise registers for wakeup.
    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(io::Error::other("cancelled"));
        }
        Poll::Pending
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CancelIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CancelIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
