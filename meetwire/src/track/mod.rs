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

//! Long-lived push and pull pipelines.
//!
//! A pipeline is owned by the handle returned from
//! [`crate::RtcEngine::push_track`] or [`crate::RtcEngine::pull_track`].
//! Dropping the last handle closes the track; a connection rebuild republishes
//! or pulls again under the same identity.

use std::sync::Arc;

use crate::rtc_engine::{Session, SessionSlot};

pub(crate) mod pull;
pub(crate) mod push;

pub use meetwire_api::{TrackDescriptor, TrackLocation, TrackObject};
pub use pull::{PullState, RemoteTrack, RemoteTrackSubscription};
pub use push::{LocalTrackPublication, PushState};

/// Why a pipeline stopped watching its current publication or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    SessionChanged,
    EngineClosed,
}

impl Interrupt {
    /// Checks whether the engine moved away from `current`.
    fn from_slot(slot: &SessionSlot, current: &Arc<Session>) -> Option<Self> {
        match slot {
            SessionSlot::Ready(session) if !Arc::ptr_eq(session, current) => {
                Some(Interrupt::SessionChanged)
            }
            SessionSlot::Closed => Some(Interrupt::EngineClosed),
            _ => None,
        }
    }
}
