//! Cooperative cancellation shared by every suspension point of a request.
//!
//! A [`CancellationToken`] is the read side: it can be queried, awaited and
//! subscribed to. The write side is a [`CancellationSource`], owned by whoever
//! is allowed to abort the operation. Cancellation is monotonic and every
//! subscribed callback runs at most once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::Result;
use crate::error::Error;
use crate::util::lock_unpoisoned;

type Callback = Box<dyn FnOnce() + Send>;

/// Identifies a callback registered with [`CancellationToken::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

struct Shared {
    signal: tokio_util::sync::CancellationToken,
    subscribers: Mutex<Subscribers>,
}

impl Shared {
    fn new(signal: tokio_util::sync::CancellationToken) -> Self {
        Self {
            signal,
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    fn cancel(&self) {
        let callbacks = {
            let mut subscribers = lock_unpoisoned(&self.subscribers);
            self.signal.cancel();
            std::mem::take(&mut subscribers.callbacks)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }
}

/// A cheaply clonable view of a cancellation signal.
///
/// The default token never fires; it is what the facade substitutes when the
/// caller does not supply one.
#[derive(Clone, Default)]
pub struct CancellationToken {
    shared: Option<Arc<Shared>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationToken")
            .field("cancellable", &self.shared.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.signal.is_cancelled())
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Resolves once the token is cancelled; never resolves for [`CancellationToken::none`].
    pub async fn cancelled(&self) {
        match &self.shared {
            Some(shared) => shared.signal.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Registers `callback` to run when the token is cancelled.
    ///
    /// The callback runs immediately when the token is already cancelled.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = &self.shared else {
            return SubscriptionId(0);
        };

        let mut subscribers = lock_unpoisoned(&shared.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        if shared.signal.is_cancelled() {
            drop(subscribers);
            callback();
        } else {
            subscribers.callbacks.insert(id, Box::new(callback));
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(shared) = &self.shared {
            lock_unpoisoned(&shared.subscribers).callbacks.remove(&id.0);
        }
    }
}

/// The owning side of a [`CancellationToken`].
pub struct CancellationSource {
    shared: Arc<Shared>,
    parent: Option<(CancellationToken, SubscriptionId)>,
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationSource")
            .field("cancelled", &self.shared.signal.is_cancelled())
            .field("linked", &self.parent.is_some())
            .finish()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(tokio_util::sync::CancellationToken::new())),
            parent: None,
        }
    }

    /// Creates a source whose token is also cancelled when `parent` is.
    ///
    /// Cancelling the child leaves the parent untouched.
    pub fn child_of(parent: &CancellationToken) -> Self {
        let Some(parent_shared) = &parent.shared else {
            return Self::new();
        };

        let shared = Arc::new(Shared::new(parent_shared.signal.child_token()));
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = parent.subscribe(move || {
            if let Some(shared) = weak.upgrade() {
                shared.cancel();
            }
        });
        Self {
            shared,
            parent: Some((parent.clone(), subscription)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.signal.is_cancelled()
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        if let Some((parent, subscription)) = self.parent.take() {
            parent.unsubscribe(subscription);
        }
    }
}
