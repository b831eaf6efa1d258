use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::SharedMetrics;
use crate::store::{self, SharedStorage};

/// Lets any connection report a fatal storage error to the server.
///
/// Only the first error raised is kept. Raising is synchronous and never blocks, so it can be
/// done from the middle of request processing.
#[derive(Clone, Default)]
pub struct Fatal {
    token: CancellationToken,
    error: Arc<Mutex<Option<store::Error>>>,
}

impl Fatal {
    pub fn new() -> Fatal {
        Fatal::default()
    }

    pub fn raise(&self, error: store::Error) {
        {
            let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until an error is raised and returns it. Only the first caller gets the error
    /// itself, later callers get a copy of its message.
    pub async fn raised(&self) -> store::Error {
        self.token.cancelled().await;

        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(error) => {
                *slot = Some(store::Error::Fatal(error.to_string()));
                error
            }
            None => store::Error::Fatal("fatal error already handled".to_string()),
        }
    }
}

/// Tears down the collaborators shared by every connection: stops the stats sampler, then closes
/// the metrics sink and the storage engine.
///
/// Both the signal handler and the fatal error path end up here, possibly at the same time. The
/// teardown runs once; a concurrent caller waits for it to finish.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    store: SharedStorage,
    metrics: SharedMetrics,
    sampler: CancellationToken,
    stopped: Mutex<bool>,
}

impl Shutdown {
    pub fn new(store: SharedStorage, metrics: SharedMetrics, sampler: CancellationToken) -> Shutdown {
        Shutdown {
            inner: Arc::new(ShutdownInner {
                store,
                metrics,
                sampler,
                stopped: Mutex::new(false),
            }),
        }
    }

    pub fn stop(&self) -> Result<(), store::Error> {
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            return Ok(());
        }
        *stopped = true;

        info!("Shutting down");
        self.inner.sampler.cancel();
        self.inner.metrics.close();

        self.inner.store.close().map_err(|e| {
            warn!("Failed to close the database: {}", e);
            e
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
