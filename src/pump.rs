// Copyright 2025 Dustin McAfee
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

//! The periodic update pump: a task with a signal channel and a rate
//! limiter, bounding how often `action` — in practice
//! `Session::send_changes` — runs.
//!
//! A standalone, reusable type matching a `Start`/`Signal`/`Stop` contract,
//! built around a `tokio::time::interval` check loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// The pump's per-tick action: returns whether it sent any changes.
pub type PumpAction = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// A running instance of the periodic update pump. Dropping this without
/// calling [`UpdatePump::stop`] leaves the background task running;
/// `Session` always calls `stop` on the way out.
pub struct UpdatePump {
    signal: Arc<Notify>,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl UpdatePump {
    /// Starts the pump: `action` runs at most `rate_hz` times per second,
    /// plus immediately if `run_immediately` is set. [`UpdatePump::signal`]
    /// can wake an early run without waiting for the next tick.
    #[must_use]
    pub fn start(action: PumpAction, rate_hz: f64, run_immediately: bool) -> Self {
        let signal = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(0.001));

        let task_signal = signal.clone();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            if run_immediately {
                action().await;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    () = task_stop.notified() => return,
                    _ = ticker.tick() => {
                        action().await;
                    }
                    () = task_signal.notified() => {
                        action().await;
                        ticker.reset();
                    }
                }
            }
        });

        Self { signal, stop, handle: Some(handle) }
    }

    /// Short-circuits the next wait, running `action` immediately.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    /// Stops the pump promptly and waits for its task to exit. Idempotent:
    /// calling it after the task has already stopped is a no-op.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
