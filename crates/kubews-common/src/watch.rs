//! Delete-and-wait bridge
//!
//! Turns "subscribe to an object's delete event, then delete it" into a single
//! completion the caller can wait on with a bound. The subscription is always
//! established before the delete is issued, so a fast removal cannot be missed.
//!
//! Every [`ObjectWatch`] is closed exactly once, whichever way the wait ends:
//! removal observed, watch ended early, delete call failed, nothing to delete,
//! timeout, or the waiting task being dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default bound for waiting on a removal
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(300);

/// Message used when a watch ends before the removal event arrives
pub const WATCH_CLOSED_EARLY: &str = "watch closed before deletion observed";

/// Result of issuing a delete call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The API accepted the deletion; removal will be reported by the watch
    Deleted,
    /// There was nothing to delete
    NotFound,
}

/// One item reported by an object watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSignal {
    /// The object still exists; carries a short description of its state
    Observed(String),
    /// The object is gone
    Deleted,
    /// The watch broke
    Failed(String),
}

/// Open subscription to the events of one object
pub struct ObjectWatch {
    signals: Option<BoxStream<'static, WatchSignal>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ObjectWatch {
    /// Wrap a stream of signals
    pub fn new(signals: BoxStream<'static, WatchSignal>) -> Self {
        Self {
            signals: Some(signals),
            on_close: None,
        }
    }

    /// Watch that replays a fixed list of signals, then ends
    pub fn from_signals(signals: Vec<WatchSignal>) -> Self {
        Self::new(futures::stream::iter(signals).boxed())
    }

    /// Watch that never reports anything
    pub fn silent() -> Self {
        Self::new(futures::stream::pending().boxed())
    }

    /// Run `hook` when the watch is closed
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Next signal, or `None` once the watch has ended or been closed
    pub async fn next(&mut self) -> Option<WatchSignal> {
        match self.signals.as_mut() {
            Some(signals) => signals.next().await,
            None => None,
        }
    }

    /// Release the subscription. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.signals.take().is_some() {
            if let Some(hook) = self.on_close.take() {
                hook();
            }
        }
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.signals.is_none()
    }
}

impl Drop for ObjectWatch {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ObjectWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWatch")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Aborts the watch task if the completion is dropped without being awaited
struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Pending {
    Resolved,
    Watching {
        task: AbortOnDrop,
        last_state: Arc<Mutex<String>>,
    },
}

/// Single-resolution handle for an issued delete
pub struct DeleteCompletion {
    resource: String,
    pending: Pending,
}

impl DeleteCompletion {
    /// The `kind/namespace/name` being removed
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Wait until the removal is observed or `timeout` elapses.
    ///
    /// On timeout the watch is closed and the delete is left in flight.
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        let Self { resource, pending } = self;
        let (mut task, last_state) = match pending {
            Pending::Resolved => return Ok(()),
            Pending::Watching { task, last_state } => (task, last_state),
        };

        match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_cancelled() => Err(Error::delete_interrupted(resource)),
            Ok(Err(join)) => Err(Error::delete_failed(resource, join.to_string())),
            Err(_) => {
                task.0.abort();
                // Resolves once the task's future, and with it the watch, is dropped
                let _ = (&mut task.0).await;
                let last = last_state.lock().clone();
                warn!(resource = %resource, timeout_secs = timeout.as_secs(), last_state = %last, "removal not observed in time");
                Err(Error::delete_timeout(resource, timeout, last))
            }
        }
    }
}

/// Subscribe, then delete, returning a completion that resolves on removal.
///
/// `subscribe` is awaited before `delete` is polled. If the delete reports
/// nothing to delete the completion is already resolved. If the delete call
/// fails, the watch is closed and the error returned as is. The delete is
/// never retried.
pub async fn begin_delete<S, D>(
    resource: impl Into<String>,
    subscribe: S,
    delete: D,
) -> Result<DeleteCompletion>
where
    S: Future<Output = Result<ObjectWatch>>,
    D: Future<Output = Result<DeleteOutcome>>,
{
    let resource = resource.into();
    let mut watch = subscribe.await?;

    match delete.await {
        Ok(DeleteOutcome::Deleted) => {}
        Ok(DeleteOutcome::NotFound) => {
            debug!(resource = %resource, "nothing to delete");
            watch.close();
            return Ok(DeleteCompletion {
                resource,
                pending: Pending::Resolved,
            });
        }
        Err(e) => {
            watch.close();
            return Err(e);
        }
    }

    let last_state = Arc::new(Mutex::new("no event received".to_string()));
    let task = tokio::spawn(follow(resource.clone(), watch, last_state.clone()));

    Ok(DeleteCompletion {
        resource,
        pending: Pending::Watching {
            task: AbortOnDrop(task),
            last_state,
        },
    })
}

/// Convenience for `begin_delete(..).await?.wait(timeout)`
pub async fn delete_and_wait<S, D>(
    resource: impl Into<String>,
    subscribe: S,
    delete: D,
    timeout: Duration,
) -> Result<()>
where
    S: Future<Output = Result<ObjectWatch>>,
    D: Future<Output = Result<DeleteOutcome>>,
{
    begin_delete(resource, subscribe, delete)
        .await?
        .wait(timeout)
        .await
}

async fn follow(
    resource: String,
    mut watch: ObjectWatch,
    last_state: Arc<Mutex<String>>,
) -> Result<()> {
    let outcome = loop {
        match watch.next().await {
            Some(WatchSignal::Deleted) => {
                debug!(resource = %resource, "removal observed");
                break Ok(());
            }
            Some(WatchSignal::Observed(state)) => *last_state.lock() = state,
            Some(WatchSignal::Failed(message)) => {
                break Err(Error::delete_failed(
                    &resource,
                    format!("{}: {}", WATCH_CLOSED_EARLY, message),
                ))
            }
            None => break Err(Error::delete_failed(&resource, WATCH_CLOSED_EARLY)),
        }
    };
    watch.close();
    outcome
}
