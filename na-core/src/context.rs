// Copyright 2020 The xi-editor Authors.
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

//! The NA context: a per-thread-domain progress/completion engine.
//!
//! This is the hardest piece of the layer (spec.md §4.2) and is ported
//! as closely as Rust idiom allows from `NA_Progress`/`NA_Trigger`/
//! `na_cb_completion_add` in the original `na.c`. The bit-packed "lock +
//! waiter count" atomic word from the C implementation is replaced with
//! a `Mutex` + `Condvar` pair per spec.md §9's explicit invitation to
//! "replace the bit layout with a cleaner primitive ... as long as the
//! properties in §8 hold."

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};

use crate::error::{NaError, NaResult};
use crate::plugin::NaClassOps;
use crate::user_data::UserData;

/// Bounded lock-free completion queue capacity, matching
/// `NA_ATOMIC_QUEUE_SIZE` in the original implementation.
pub const COMPLETION_QUEUE_CAPACITY: usize = 1024;

/// Whether a context's progress may block waiting for plugin I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    NoBlock,
    Blocking,
}

/// An entry pushed by a plugin when an operation finishes. Carries the
/// user callback (and, via closure capture, its argument) plus an
/// optional plugin-private finalisation callback run strictly after the
/// user callback returns.
pub struct CompletionRecord {
    callback: Box<dyn FnOnce() -> i32 + Send>,
    plugin_callback: Option<Box<dyn FnOnce() + Send>>,
}

impl CompletionRecord {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        CompletionRecord { callback: Box::new(callback), plugin_callback: None }
    }

    /// Attaches a plugin finalisation callback. Per spec.md §4.2, the
    /// plugin must not reuse the operation id until this has run.
    pub fn with_plugin_callback<F>(mut self, plugin_callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.plugin_callback = Some(Box::new(plugin_callback));
        self
    }
}

struct ProgressState {
    locked: bool,
    waiters: u32,
}

/// Outcome of a [`Context::trigger`] call.
pub struct TriggerOutcome {
    pub status: NaError,
    pub actual_count: u32,
    /// Per-record return codes of the user callback, in dequeue order.
    pub callback_rets: Vec<i32>,
}

pub struct Context {
    plugin: Arc<dyn NaClassOps>,
    mode: ProgressMode,
    /// Optional context id (0-255) used for server-side routing between
    /// sibling contexts of the same class; owned by the HG layer.
    ctx_id: Option<u8>,

    queue: ArrayQueue<CompletionRecord>,
    backfill: Mutex<VecDeque<CompletionRecord>>,
    backfill_count: AtomicUsize,
    trigger_waiting: AtomicUsize,
    completion_cond: Condvar,

    progress_state: Mutex<ProgressState>,
    progress_cond: Condvar,

    user_data: Mutex<Option<UserData>>,
}

impl Context {
    pub(crate) fn new(plugin: Arc<dyn NaClassOps>, mode: ProgressMode, ctx_id: Option<u8>) -> Arc<Self> {
        Arc::new(Context {
            plugin,
            mode,
            ctx_id,
            queue: ArrayQueue::new(COMPLETION_QUEUE_CAPACITY),
            backfill: Mutex::new(VecDeque::new()),
            backfill_count: AtomicUsize::new(0),
            trigger_waiting: AtomicUsize::new(0),
            completion_cond: Condvar::new(),
            progress_state: Mutex::new(ProgressState { locked: false, waiters: 0 }),
            progress_cond: Condvar::new(),
            user_data: Mutex::new(None),
        })
    }

    pub fn ctx_id(&self) -> Option<u8> {
        self.ctx_id
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.mode
    }

    pub fn set_user_data(&self, data: UserData) {
        *self.user_data.lock().unwrap() = Some(data);
    }

    pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&UserData>) -> R) -> R {
        f(self.user_data.lock().unwrap().as_ref())
    }

    fn queues_nonempty(&self) -> bool {
        !self.queue.is_empty() || self.backfill_count.load(Ordering::Acquire) > 0
    }

    /// `HG_Core_context_destroy` refuses to tear down a context with
    /// completions still waiting to be triggered; this is how it checks.
    pub fn has_pending_completions(&self) -> bool {
        self.queues_nonempty()
    }

    /// Enqueue contract (producer side): a single attempt is made to
    /// push into the bounded lock-free queue; on overflow the record
    /// falls back to the mutex-protected backfill list. If a thread is
    /// parked in `trigger`, wake it.
    pub fn completion_add(&self, record: CompletionRecord) {
        match self.queue.push(record) {
            Ok(()) => {}
            Err(record) => {
                trace!("completion queue full, spilling to backfill");
                let mut backfill = self.backfill.lock().unwrap();
                backfill.push_back(record);
                self.backfill_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        if self.trigger_waiting.load(Ordering::Acquire) > 0 {
            let _guard = self.backfill.lock().unwrap();
            self.completion_cond.notify_one();
        }
    }

    fn pop_record(&self) -> Option<CompletionRecord> {
        if let Some(record) = self.queue.pop() {
            return Some(record);
        }
        if self.backfill_count.load(Ordering::Acquire) > 0 {
            let mut backfill = self.backfill.lock().unwrap();
            if let Some(record) = backfill.pop_front() {
                self.backfill_count.fetch_sub(1, Ordering::AcqRel);
                return Some(record);
            }
        }
        None
    }

    /// Advisory: is it safe for the caller to park on the plugin's
    /// underlying descriptor without risking a missed completion?
    pub fn poll_try_wait(self: &Arc<Self>) -> bool {
        if self.mode == ProgressMode::NoBlock {
            return false;
        }
        if self.queues_nonempty() {
            return false;
        }
        self.plugin.poll_try_wait(self)
    }

    /// Progress contract (spec.md §4.2). Only one thread executes
    /// inside the plugin's `progress` at a time; others either observe
    /// the winner's completions or park on the progress condvar.
    pub fn progress(self: &Arc<Self>, timeout_ms: u32) -> NaResult<()> {
        let mut remaining = match self.mode {
            ProgressMode::NoBlock => 0.0,
            ProgressMode::Blocking => timeout_ms as f64 / 1000.0,
        };

        {
            let mut state = self.progress_state.lock().unwrap();
            state.waiters += 1;
            loop {
                if !state.locked {
                    state.locked = true;
                    break;
                }
                if remaining <= 0.0 {
                    state.waiters -= 1;
                    return Err(NaError::Timeout);
                }
                let start = Instant::now();
                let (guard, result) =
                    self.progress_cond.wait_timeout(state, Duration::from_secs_f64(remaining)).unwrap();
                state = guard;
                if result.timed_out() {
                    state.waiters -= 1;
                    return Err(NaError::Timeout);
                }
                remaining -= start.elapsed().as_secs_f64();
                if remaining < 0.0 {
                    remaining = 0.0;
                }
            }
        }
        // We now hold the progress lock; step 4-5.
        let outcome = if self.queues_nonempty() {
            Ok(())
        } else {
            self.plugin.progress(self, (remaining * 1000.0) as u32)
        };

        // Step 6: release lock and waiter count in one critical section,
        // signalling only if another waiter remains.
        let mut state = self.progress_state.lock().unwrap();
        state.locked = false;
        state.waiters -= 1;
        if state.waiters > 0 {
            self.progress_cond.notify_one();
        }
        drop(state);

        outcome
    }

    /// Trigger contract (spec.md §4.2). Dequeues up to `max_count`
    /// completion records and invokes their callbacks.
    ///
    /// Preserves the documented quirk: the condvar wait inside the loop
    /// uses the *original* `timeout_ms` on every iteration, not the
    /// decremented remaining budget.
    pub fn trigger(&self, timeout_ms: u32, max_count: u32) -> TriggerOutcome {
        let mut remaining = match self.mode {
            ProgressMode::NoBlock => 0.0,
            ProgressMode::Blocking => timeout_ms as f64 / 1000.0,
        };
        let effective_timeout_ms = match self.mode {
            ProgressMode::NoBlock => 0,
            ProgressMode::Blocking => timeout_ms,
        };

        let mut status = NaError::Success;
        let mut count = 0u32;
        let mut callback_rets = Vec::new();

        while count < max_count {
            let record = match self.pop_record() {
                Some(r) => r,
                None => {
                    if count > 0 {
                        break;
                    }
                    if (remaining * 1000.0) as i64 <= 0 {
                        status = NaError::Timeout;
                        break;
                    }

                    self.trigger_waiting.fetch_add(1, Ordering::AcqRel);
                    let start = Instant::now();
                    let mut guard = self.backfill.lock().unwrap();
                    let mut timed_out = false;
                    while self.queue.is_empty() && self.backfill_count.load(Ordering::Acquire) == 0 {
                        let (g, result) = self
                            .completion_cond
                            .wait_timeout(guard, Duration::from_millis(effective_timeout_ms as u64))
                            .unwrap();
                        guard = g;
                        if result.timed_out() {
                            timed_out = true;
                            break;
                        }
                    }
                    drop(guard);
                    self.trigger_waiting.fetch_sub(1, Ordering::AcqRel);

                    if timed_out {
                        status = NaError::Timeout;
                        break;
                    }
                    remaining -= start.elapsed().as_secs_f64();
                    continue;
                }
            };

            let ret = (record.callback)();
            callback_rets.push(ret);
            if let Some(plugin_cb) = record.plugin_callback {
                plugin_cb();
            }
            count += 1;
        }

        debug!("trigger: dequeued {} record(s), status={:?}", count, status);
        TriggerOutcome { status, actual_count: count, callback_rets }
    }

    pub(crate) fn plugin(&self) -> &Arc<dyn NaClassOps> {
        &self.plugin
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.queues_nonempty() {
            warn!("context destroyed with undelivered completions pending");
        }
    }
}
