//! Background truncation with an explicit completion handle.

use anyhow::Result;
use model::{CfId, ReplayPosition};
use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::{EngineError, Inner};

/// What a completed truncate did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateOutcome {
    pub cf_id: CfId,
    /// Nothing at or below this position will ever be replayed for the CF.
    pub truncated_at: ReplayPosition,
    pub tables_removed: usize,
}

/// Completion handle returned by [`Database::truncate`](crate::Database::truncate).
///
/// Dropping the handle does not cancel the truncate; it still runs to
/// completion. Callers that need read-your-writes-after-truncate must call
/// [`wait`](TruncateHandle::wait).
#[derive(Debug)]
pub struct TruncateHandle {
    keyspace: String,
    name: String,
    handle: JoinHandle<Result<TruncateOutcome>>,
}

impl TruncateHandle {
    /// Blocks until the truncate finishes.
    ///
    /// # Errors
    ///
    /// Returns the protocol's error (for example
    /// [`EngineError::MetadataPersist`], in which case nothing was deleted
    /// and the truncate can be retried), or [`EngineError::TruncateAborted`]
    /// if the truncate thread panicked.
    pub fn wait(self) -> Result<TruncateOutcome> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => Err(EngineError::TruncateAborted {
                keyspace: self.keyspace,
                name: self.name,
                reason: panic_message(panic.as_ref()),
            }
            .into()),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "truncate thread panicked".to_string()
    }
}

impl Inner {
    /// Starts truncating `keyspace.name` on a thread named `truncate-<name>`.
    pub(crate) fn spawn_truncate(self: &Arc<Self>, keyspace: &str, name: &str) -> Result<TruncateHandle> {
        self.ensure_open()?;
        let store = Arc::clone(self.store(keyspace, name)?);
        let inner = Arc::clone(self);

        tracing::info!(keyspace, cf = name, "truncate requested");
        let handle = thread::Builder::new()
            .name(format!("truncate-{}", name))
            .spawn(move || -> Result<TruncateOutcome> {
                let (truncated_at, tables_removed) = store
                    .truncate_blocking(|| inner.discard_completed().map(|_| ()))
                    .map_err(|e| {
                        tracing::error!(
                            keyspace = store.keyspace(),
                            cf = store.name(),
                            error = %format!("{:#}", e),
                            "truncate failed"
                        );
                        e
                    })?;
                Ok(TruncateOutcome {
                    cf_id: store.cf_id(),
                    truncated_at,
                    tables_removed,
                })
            })?;

        Ok(TruncateHandle {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            handle,
        })
    }
}
