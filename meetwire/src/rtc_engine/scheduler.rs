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
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the scheduler dropped the task before it completed")]
pub struct TaskDropped;

/// Runs tasks strictly one at a time, in the order they were scheduled.
///
/// Enqueueing is synchronous: the position of a task is fixed when
/// [`TaskScheduler::schedule`] returns, not when the returned future is first
/// polled. A task that fails only fails its own caller.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    queue: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl TaskScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (queue, tasks) = mpsc::unbounded_channel();
        tokio::spawn(scheduler_task(tasks));
        Self { queue }
    }

    pub fn schedule<F, T>(&self, task: F) -> Scheduled<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = result_tx.send(task.await);
        });

        if self.queue.send(task).is_err() {
            // The result sender was dropped with the task, Scheduled resolves to TaskDropped
            log::warn!("scheduler task is gone, dropping task");
        }

        Scheduled { result: result_rx }
    }
}

async fn scheduler_task(mut tasks: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>) {
    while let Some(task) = tasks.recv().await {
        // A panicking task drops its result sender, its caller sees TaskDropped
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            log::error!("scheduled task panicked: {}", panic_message(panic.as_ref()));
        }
    }

    log::trace!("scheduler task closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Result of a task handed to a [`TaskScheduler`].
#[derive(Debug)]
#[must_use = "the task runs regardless, but its result is lost if this is dropped"]
pub struct Scheduled<T> {
    result: oneshot::Receiver<T>,
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T, TaskDropped>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx).map_err(|_| TaskDropped)
    }
}
