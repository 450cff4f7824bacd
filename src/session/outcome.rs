use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::error::SessionError;

/// Awaitable result of a publish, subscribe or unsubscribe.
///
/// The request has already been handed to the transport by the time an
/// `Outcome` exists; awaiting it only waits for the acknowledgement. Dropping
/// it does not cancel the request.
#[must_use = "an Outcome reports whether the operation succeeded"]
#[derive(Debug)]
pub struct Outcome {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Ready(Option<Result<(), SessionError>>),
    Waiting(oneshot::Receiver<Result<(), SessionError>>),
}

impl Outcome {
    pub(crate) fn ready(result: Result<(), SessionError>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<Result<(), SessionError>>) -> Self {
        Self {
            inner: Inner::Waiting(rx),
        }
    }
}

impl Future for Outcome {
    type Output = Result<(), SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(SessionError::Disconnected)))
            }
            // A dropped sender means the operation was discarded without settling
            Inner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(SessionError::Disconnected))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_outcome_resolves_immediately() {
        assert_eq!(Outcome::ready(Ok(())).await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_sender_reports_disconnected() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        assert_eq!(Outcome::waiting(rx).await, Err(SessionError::Disconnected));
    }
}
