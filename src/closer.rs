//! Connection close signal shared by both halves of a connection and its
//! deadline.
//!
//! Closing is how a connection is cancelled: the deadline fires `close()`,
//! either task calls it on teardown, and every pending read, write or wait
//! guarded by the same [`Closer`] resolves with
//! [`CometError::ConnectionClosed`].

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{CometError, Result};

/// Cloneable handle that closes one connection.
#[derive(Debug, Clone)]
pub struct Closer {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl Closer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Close the connection. Returns `true` only for the call that actually
    /// closed it; closing twice is harmless.
    pub fn close(&self) -> bool {
        !self.state.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `fut` unless the connection closes first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.closed() => Err(CometError::ConnectionClosed),
            res = fut => res,
        }
    }
}
