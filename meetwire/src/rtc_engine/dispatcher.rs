// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("the batch result has no entry for this request")]
    MissingResult,
    #[error("the batch was dropped before it completed")]
    Dropped,
}

/// Outcome of one executed batch: either a failure shared by every request,
/// or a result per key.
pub type BatchOutput<K, R, E> = Result<HashMap<K, Result<R, E>>, E>;

type Executor<K, P, R, E> =
    Arc<dyn Fn(Vec<(K, P)>) -> BoxFuture<'static, BatchOutput<K, R, E>> + Send + Sync>;

struct PendingEntry<K, P, R, E> {
    key: K,
    payload: P,
    waiters: Vec<oneshot::Sender<Result<R, E>>>,
}

struct PendingBatch<K, P, R, E> {
    generation: u64,
    entries: Vec<PendingEntry<K, P, R, E>>,
}

struct DispatcherState<K, P, R, E> {
    pending: Option<PendingBatch<K, P, R, E>>,
    next_generation: u64,
}

struct DispatcherInner<K, P, R, E> {
    max_batch_size: usize,
    flush_delay: Duration,
    executor: Executor<K, P, R, E>,
    state: Mutex<DispatcherState<K, P, R, E>>,
}

/// Coalesces requests registered within one scheduling turn into a single
/// call of the batch executor.
///
/// The first registration into an empty batch defers a flush by one tick (or
/// by `flush_delay`). A batch that reaches `max_batch_size` is flushed right
/// away, and the deferred flush of that batch becomes a no-op. Requests with
/// an equal key join the pending entry instead of adding a new one.
///
/// The executor receives a snapshot of the batch. Requests registered while it
/// runs go into a fresh batch.
pub struct BulkRequestDispatcher<K, P, R, E> {
    inner: Arc<DispatcherInner<K, P, R, E>>,
}

impl<K, P, R, E> Clone for BulkRequestDispatcher<K, P, R, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, P, R, E> Debug for BulkRequestDispatcher<K, P, R, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkRequestDispatcher")
            .field("max_batch_size", &self.inner.max_batch_size)
            .field("flush_delay", &self.inner.flush_delay)
            .finish()
    }
}

impl<K, P, R, E> BulkRequestDispatcher<K, P, R, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    P: Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + From<DispatchError> + Send + 'static,
{
    pub fn new<F>(max_batch_size: usize, flush_delay: Duration, executor: F) -> Self
    where
        F: Fn(Vec<(K, P)>) -> BoxFuture<'static, BatchOutput<K, R, E>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DispatcherInner {
                max_batch_size: max_batch_size.max(1),
                flush_delay,
                executor: Arc::new(executor),
                state: Mutex::new(DispatcherState { pending: None, next_generation: 0 }),
            }),
        }
    }

    /// Adds a request to the pending batch. The batch membership is decided
    /// here, synchronously; awaiting the returned value only waits for the
    /// outcome. Must be called from within a tokio runtime.
    pub fn register(&self, key: K, payload: P) -> BatchResult<R, E> {
        let (tx, rx) = oneshot::channel();

        let full_batch = {
            let mut state = self.inner.state.lock();
            if state.pending.is_none() {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.pending = Some(PendingBatch { generation, entries: Vec::new() });
                self.schedule_flush(generation);
            }

            let Some(batch) = state.pending.as_mut() else {
                unreachable!("a pending batch was just ensured")
            };

            match batch.entries.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.waiters.push(tx),
                None => batch.entries.push(PendingEntry { key, payload, waiters: vec![tx] }),
            }

            if batch.entries.len() >= self.inner.max_batch_size {
                state.pending.take()
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            tokio::spawn(self.inner.clone().execute(batch));
        }

        BatchResult { rx }
    }

    fn schedule_flush(&self, generation: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if inner.flush_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(inner.flush_delay).await;
            }

            let batch = {
                let mut state = inner.state.lock();
                match &state.pending {
                    Some(batch) if batch.generation == generation => state.pending.take(),
                    // Already flushed because it reached the size cap
                    _ => None,
                }
            };

            if let Some(batch) = batch {
                inner.execute(batch).await;
            }
        });
    }
}

impl<K, P, R, E> DispatcherInner<K, P, R, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    P: Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + From<DispatchError> + Send + 'static,
{
    async fn execute(self: Arc<Self>, batch: PendingBatch<K, P, R, E>) {
        let mut requests = Vec::with_capacity(batch.entries.len());
        let mut waiters = Vec::with_capacity(batch.entries.len());
        for entry in batch.entries {
            requests.push((entry.key.clone(), entry.payload));
            waiters.push((entry.key, entry.waiters));
        }

        log::trace!("executing batch {} with {} requests", batch.generation, requests.len());

        match (self.executor)(requests).await {
            Ok(mut results) => {
                for (key, senders) in waiters {
                    let result = results
                        .remove(&key)
                        .unwrap_or_else(|| Err(E::from(DispatchError::MissingResult)));
                    for sender in senders {
                        let _ = sender.send(result.clone());
                    }
                }
            }
            Err(err) => {
                for sender in waiters.into_iter().flat_map(|(_, senders)| senders) {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Outcome of a request registered with a [`BulkRequestDispatcher`].
#[derive(Debug)]
pub struct BatchResult<R, E> {
    rx: oneshot::Receiver<Result<R, E>>,
}

impl<R, E: From<DispatchError>> Future for BatchResult<R, E> {
    type Output = Result<R, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(E::from(DispatchError::Dropped))))
    }
}
