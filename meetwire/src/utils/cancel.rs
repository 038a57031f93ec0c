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

use tokio::sync::watch;

/// Cancels every [`CancelSignal`] of its pair when dropped.
#[derive(Debug)]
pub(crate) struct CancelGuard {
    _tx: watch::Sender<()>,
}

/// Observes whether the paired [`CancelGuard`] is still alive.
#[derive(Debug, Clone)]
pub(crate) struct CancelSignal {
    rx: watch::Receiver<()>,
}

pub(crate) fn cancel_pair() -> (CancelGuard, CancelSignal) {
    let (tx, rx) = watch::channel(());
    (CancelGuard { _tx: tx }, CancelSignal { rx })
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Resolves once the guard is dropped. Safe to await repeatedly.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Nothing is ever sent, so this only returns when the sender is gone
        while rx.changed().await.is_ok() {}
    }
}
