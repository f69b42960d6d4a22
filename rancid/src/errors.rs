//! Utilities for handling errors in long-running streams

use futures_core::{Future, TryStream, Stream};
use futures_util::ready;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time;

pin_project_lite::pin_project! {
    /// Wraps a [`Stream`], handling errors by logging them and backing off
    ///
    /// The first error after a success is followed by an immediate poll. Each further consecutive
    /// error delays the next poll, doubling the delay up to a maximum. A successful item resets
    /// the backoff.
    #[derive(Debug)]
    pub struct LogAndSleep<S> {
        initial: time::Duration,
        max: time::Duration,
        failures: u32,

        #[pin]
        sleep: time::Sleep,
        sleeping: bool,

        #[pin]
        stream: S,
    }
}

impl<S> LogAndSleep<S> {
    /// Sleeps for `delay` before each retry after the first of a run of errors
    pub fn fixed_delay(delay: time::Duration, stream: S) -> Self {
        Self::backoff(delay, delay, stream)
    }

    /// Creates an error handling stream whose delay doubles from `initial` up to `max`
    pub fn backoff(initial: time::Duration, max: time::Duration, stream: S) -> Self {
        Self {
            initial,
            max,
            failures: 0,
            sleep: time::sleep(time::Duration::ZERO),
            sleeping: false,
            stream,
        }
    }
}

impl<S> Stream for LogAndSleep<S>
where
    S: TryStream,
    S::Error: std::fmt::Display,
{
    type Item = S::Ok;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.sleeping {
                ready!(this.sleep.as_mut().poll(cx));
                *this.sleeping = false;
            }

            match ready!(this.stream.as_mut().try_poll_next(cx)) {
                None => {
                    *this.failures = 0;
                    return Poll::Ready(None);
                }

                Some(Ok(item)) => {
                    *this.failures = 0;
                    return Poll::Ready(Some(item));
                }

                Some(Err(error)) => {
                    tracing::warn!(%error, failures = *this.failures + 1, "Stream failed");
                    if *this.failures > 0 {
                        let factor = 2u32.saturating_pow(*this.failures - 1);
                        let delay = this.initial.saturating_mul(factor).min(*this.max);
                        tracing::debug!(?delay, "Backing off");
                        *this.sleeping = true;
                        this.sleep.as_mut().reset(time::Instant::now() + delay);
                    }
                    *this.failures = this.failures.saturating_add(1);
                }
            };
        }
    }
}
