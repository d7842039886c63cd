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

//! Abstraction over the executor so background tasks are spawned the same
//! way everywhere in the workspace.
//!
//! This re-exports parts of tokio directly and adds a handle which aborts its
//! task once dropped.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub use tokio::task::{spawn, AbortHandle, JoinError, JoinHandle};

/// A type ensuring a task is aborted on drop.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(join_handle: JoinHandle<T>) -> Self {
        Self(join_handle)
    }

    /// Has the underlying task finished, either by completing or by being
    /// aborted.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T: 'static> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(context)
    }
}

/// Trait to create an [`AbortOnDrop`] from a [`JoinHandle`].
pub trait JoinHandleExt<T> {
    fn abort_on_drop(self) -> AbortOnDrop<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDrop<T> {
        AbortOnDrop::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;

    use super::{spawn, JoinHandleExt};

    #[tokio::test]
    async fn test_spawn() {
        let future = async { 42 };
        let join_handle = spawn(future);

        assert_matches!(join_handle.await, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));

        let handle = spawn({
            let ran = ran.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                ran.store(true, Ordering::SeqCst);
            }
        })
        .abort_on_drop();

        drop(handle);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!ran.load(Ordering::SeqCst), "the task should have been aborted");
    }
}
