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

//! Client-side engine that publishes and subscribes media tracks through a
//! remote media-routing service over one transport connection.
//!
//! Requests issued in the same scheduling turn are coalesced into a single
//! negotiation round trip, negotiation steps on a connection never
//! interleave, and a lost connection is rebuilt with every published and
//! subscribed track restored.

mod rtc_engine;
pub mod track;
mod utils;

/// `use meetwire::prelude::*;` to import the engine types
pub mod prelude;

pub use meetwire_api as api;
pub use meetwire_rtc as webrtc;
pub use rtc_engine::*;
