//! # Abort Signals
//!
//! Cancellation for every externally-callable operation. An [`AbortSignal`] is
//! a cheap value that fires at most once; operations `select!` their work
//! against [`AbortSignal::aborted`]. Signals compose: a dial runs under the
//! caller's signal merged with the node shutdown signal merged with the dial
//! timeout, and whichever fires first cancels the operation.
//!
//! Three sources:
//! - **manual**: fired explicitly through an [`AbortHandle`]
//! - **deadline**: fires when a timeout elapses
//! - **never**: the identity element, for callers that don't need cancellation
//!
//! A merged signal flattens its constituents rather than nesting, so deeply
//! composed signals stay a single flat `Vec` plus the earliest deadline.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Fires an [`AbortSignal`] that was created with [`AbortSignal::manual`].
///
/// Cloneable; any clone may fire the signal. Dropping all handles without
/// firing leaves the signal pending forever.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Fire the signal. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    /// True if [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A composable cancellation signal.
#[derive(Clone)]
pub struct AbortSignal {
    /// Manual triggers; the signal fires when any sends `true`.
    flags: Vec<watch::Receiver<bool>>,
    /// Earliest deadline across all merged constituents.
    deadline: Option<Instant>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { flags: Vec::new(), deadline: None }
    }

    /// A signal fired explicitly through the returned handle.
    pub fn manual() -> (AbortHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (AbortHandle { tx }, Self { flags: vec![rx], deadline: None })
    }

    /// A signal that fires once `after` has elapsed from now.
    pub fn deadline(after: Duration) -> Self {
        Self { flags: Vec::new(), deadline: Some(Instant::now() + after) }
    }

    /// Combine with another signal; the result fires when either fires.
    pub fn merge(&self, other: &AbortSignal) -> AbortSignal {
        let mut flags = self.flags.clone();
        flags.extend(other.flags.iter().cloned());
        let deadline = match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        AbortSignal { flags, deadline }
    }

    /// Non-blocking check.
    pub fn is_aborted(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.flags.iter().any(|rx| *rx.borrow())
    }

    /// True if the *deadline* constituent is what fired (or would fire first).
    /// Used to map a cancelled dial to `ErrTimeout` rather than `ErrAborted`.
    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the signal fires. Pends forever for [`never`](Self::never)
    /// and for manual signals whose every handle was dropped without firing.
    pub async fn aborted(&self) {
        let mut flags = self.flags.clone();
        loop {
            if self.is_aborted() {
                return;
            }
            // A flag whose sender was dropped without firing can never fire;
            // waiting on it would resolve immediately on every iteration.
            // Drop it from the wait set instead.
            flags.retain(|rx| rx.has_changed().is_ok());

            // Wait for any live flag to change or the deadline to pass.
            let flag_wait = async {
                if flags.is_empty() {
                    std::future::pending::<()>().await;
                } else {
                    let waits = flags.iter_mut().map(|rx| Box::pin(rx.changed()));
                    let _ = futures_select_all(waits).await;
                }
            };
            match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = flag_wait => {}
                        _ = tokio::time::sleep_until(deadline) => return,
                    }
                }
                None => flag_wait.await,
            }
        }
    }
}

/// Minimal select-all over a small set of futures. The watch channels this is
/// used with number at most a handful per operation, so polling each in turn
/// is cheaper than pulling in a combinator library for one call site.
async fn futures_select_all<F>(futures: impl Iterator<Item = F>)
where
    F: std::future::Future + Unpin,
{
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct SelectAll<F>(Vec<F>);

    impl<F: std::future::Future + Unpin> std::future::Future for SelectAll<F> {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            for fut in self.0.iter_mut() {
                if Pin::new(fut).poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        }
    }

    SelectAll(futures.collect()).await
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("flags", &self.flags.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_is_pending() {
        let signal = AbortSignal::never();
        assert!(!signal.is_aborted());
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.aborted()).await;
        assert!(fired.is_err(), "never() must not fire");
    }

    #[tokio::test]
    async fn manual_fires_once_aborted() {
        let (handle, signal) = AbortSignal::manual();
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
        tokio::time::timeout(Duration::from_secs(1), signal.aborted())
            .await
            .expect("aborted() should resolve after abort()");
    }

    #[tokio::test]
    async fn deadline_fires() {
        let signal = AbortSignal::deadline(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(1), signal.aborted())
            .await
            .expect("deadline signal should fire");
        assert!(signal.deadline_elapsed());
    }

    #[tokio::test]
    async fn merged_fires_on_either_constituent() {
        let (handle, manual) = AbortSignal::manual();
        let merged = manual.merge(&AbortSignal::never());
        assert!(!merged.is_aborted());

        handle.abort();
        tokio::time::timeout(Duration::from_secs(1), merged.aborted())
            .await
            .expect("merged signal should observe constituent abort");

        let merged = AbortSignal::never().merge(&AbortSignal::deadline(Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(1), merged.aborted())
            .await
            .expect("merged signal should observe deadline");
    }

    #[tokio::test]
    async fn dropped_handle_leaves_signal_pending() {
        let (handle, signal) = AbortSignal::manual();
        drop(handle);
        assert!(!signal.is_aborted());
        // The dead flag must neither fire nor spin; aborted() stays pending.
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.aborted()).await;
        assert!(fired.is_err(), "a handle dropped without firing must never fire");

        // A deadline merged alongside a dead flag still fires.
        let (handle, manual) = AbortSignal::manual();
        drop(handle);
        let merged = manual.merge(&AbortSignal::deadline(Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(1), merged.aborted())
            .await
            .expect("deadline should fire despite the dead flag");

        // A live flag merged alongside a dead one still fires too.
        let (dead, dead_signal) = AbortSignal::manual();
        drop(dead);
        let (live, live_signal) = AbortSignal::manual();
        let merged = dead_signal.merge(&live_signal);
        live.abort();
        tokio::time::timeout(Duration::from_secs(1), merged.aborted())
            .await
            .expect("live flag should fire despite the dead one");
    }

    #[tokio::test]
    async fn merge_keeps_earliest_deadline() {
        let a = AbortSignal::deadline(Duration::from_secs(60));
        let b = AbortSignal::deadline(Duration::from_millis(10));
        let merged = a.merge(&b);
        tokio::time::timeout(Duration::from_secs(1), merged.aborted())
            .await
            .expect("earliest deadline should win");
    }
}
