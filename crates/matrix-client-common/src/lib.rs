// Copyright 2024 The Matrix.org Foundation C.I.C.
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

#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]

pub mod deserialized_responses;
pub mod executor;
pub mod failures_cache;
pub mod sleep;

/// Super trait that is used for our capability traits.
///
/// Everything crossing an `await` inside one of the background tasks must be
/// `Send` and `Sync`, and we want to be able to log the implementors.
pub trait AsyncTraitDeps: std::fmt::Debug + Send + Sync {}
impl<T: std::fmt::Debug + Send + Sync> AsyncTraitDeps for T {}

