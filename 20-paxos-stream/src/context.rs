//! Cancellation and deadline propagation for in-flight requests.
//!
//! A [`Context`] is handed to every collaborator call. Its
//! [`Context::cancelled`] future completes when any [`CancelHandle`] in its
//! ancestry fires or is dropped, or when its deadline passes. The server owns
//! the root handle and each connection owns a child, so a dropped connection
//! tears down any quorum round or `pull` subscription it started.

use std::{future::Future, time::Duration};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep_until},
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Owner side of a cancellable [`Context`]. Dropping it cancels too.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        Self::background().child()
    }

    /// Derives a context cancelled by its own handle or by any of `self`'s.
    pub fn child(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut signals = self.signals.clone();
        signals.push(rx);
        let ctx = Self {
            signals,
            deadline: self.deadline,
        };
        (ctx, CancelHandle { tx })
    }

    /// Derives a context that also expires after `timeout`. An earlier
    /// deadline already carried by `self` wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            signals: self.signals.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        let signalled = self
            .signals
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        signalled || expired
    }

    /// Resolves once the context is cancelled or its deadline has passed.
    pub async fn cancelled(&self) {
        let signal: BoxFuture<'static, ()> = if self.signals.is_empty() {
            future::pending().boxed()
        } else {
            let waits = self.signals.iter().cloned().map(|mut rx| {
                async move {
                    // A dropped handle counts as cancellation.
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                .boxed()
            });
            future::select_all(waits).map(|_| ()).boxed()
        };
        let expiry = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        select! {
            _ = signal => {}
            _ = expiry => {}
        }
    }

    /// Drives `fut` unless the context is cancelled first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancel_handle_interrupts_pending_work() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let result = ctx.run(future::pending::<()>()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels() {
        let (ctx, handle) = Context::with_cancel();
        drop(handle);
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let (parent, parent_handle) = Context::with_cancel();
        let (child, _child_handle) = parent.child();
        let (sibling, sibling_handle) = parent.child();

        sibling_handle.cancel();
        assert!(sibling.is_cancelled());
        assert!(!child.is_cancelled());
        assert!(!parent.is_cancelled());

        parent_handle.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_work() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let result = ctx.run(future::pending::<()>()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_is_kept() {
        let outer = Context::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }
}
