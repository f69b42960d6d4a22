//! Graceful shutdown on `SIGINT` or `SIGTERM`

use futures_core::{Future, Stream};
use std::{
    pin::Pin,
    task::{Context, Poll},
};

mod signals;

pub use drain::Watch;

/// Waits for a termination signal, then for outstanding work to finish.
#[derive(Debug)]
#[must_use = "call `Shutdown::signaled` to await a signal"]
pub struct Shutdown {
    signals: signals::Signals,
    tx: drain::Signal,
}

/// How shutdown ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Every [`Watch`] was released.
    Terminated,

    /// A second signal arrived before every [`Watch`] was released.
    Aborted,
}

/// A signal handler could not be installed
#[derive(Debug, thiserror::Error)]
#[error("failed to register signal handler: {0}")]
pub struct RegisterError(#[from] std::io::Error);

pin_project_lite::pin_project! {
    /// Wraps a [`Stream`] so that it ends once shutdown is signaled.
    #[must_use = "streams do nothing unless polled"]
    pub struct CancelOnShutdown<T> {
        #[pin]
        inner: T,
        signaled: Option<Pin<Box<dyn Future<Output = drain::ReleaseShutdown> + Send>>>,
    }
}

/// Creates a shutdown channel driven by `SIGINT` and `SIGTERM`.
///
/// When a signal is received, [`Watch`] instances are notified and, once all of them are
/// dropped, shutdown completes. A second signal received while waiting aborts the shutdown.
pub fn sigint_or_sigterm() -> Result<(Shutdown, Watch), RegisterError> {
    let signals = signals::Signals::new()?;
    let (tx, rx) = drain::channel();
    Ok((Shutdown { signals, tx }, rx))
}

// === impl Shutdown ===

impl Shutdown {
    /// Waits for a signal and then for all watches to be released.
    pub async fn signaled(self) -> Completion {
        let Self { mut signals, tx } = self;
        signals.recv().await;
        tracing::info!("Shutting down");
        drive(tx, signals.recv()).await
    }
}

async fn drive(tx: drain::Signal, abort: impl Future<Output = ()>) -> Completion {
    tokio::select! {
        _ = tx.drain() => {
            tracing::debug!("Drained");
            Completion::Terminated
        }

        _ = abort => {
            tracing::info!("Aborting shutdown");
            Completion::Aborted
        }
    }
}

// === impl CancelOnShutdown ===

impl<T> CancelOnShutdown<T> {
    pub fn new(watch: Watch, inner: T) -> Self {
        Self {
            inner,
            signaled: Some(Box::pin(watch.signaled())),
        }
    }
}

impl<T: Stream> Stream for CancelOnShutdown<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T::Item>> {
        let this = self.project();
        let Some(signaled) = this.signaled.as_mut() else {
            return Poll::Ready(None);
        };
        if let Poll::Ready(release) = signaled.as_mut().poll(cx) {
            drop(release);
            *this.signaled = None;
            tracing::debug!("Stream canceled on shutdown");
            return Poll::Ready(None);
        }
        this.inner.poll_next(cx)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CancelOnShutdown<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelOnShutdown")
            .field("inner", &self.inner)
            .field("signaled", &self.signaled.is_none())
            .finish()
    }
}
