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

//! The RPC handle: spec.md's CREATED -> forward -> POSTED ->
//! plugin-complete -> COMPLETED state machine (§4), given to both the
//! caller that issues a `forward` and the callback that answers it with
//! `respond`.
//!
//! Reference counting piggybacks on `Arc` exactly like `na_core::Addr`:
//! `ref_incr` is `Arc::clone`, `ref_get` is `Arc::strong_count`, and
//! `destroy` is letting the last `Arc` drop. There is no separate
//! DESTROYED state to model -- once the last reference drops, the
//! handle simply no longer exists.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use std::sync::Arc;

use na_core::{Addr, OpId};

use crate::context::HgContext;
use crate::error::HgError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No NA operation in flight; input/output may be written.
    Created,
    /// A `forward` or `respond` send (or its paired response receive)
    /// is in flight.
    Posted,
    /// The in-flight operation has finished and delivered its outcome.
    Completed,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Created,
            1 => HandleState::Posted,
            _ => HandleState::Completed,
        }
    }
}

struct Mutable {
    target: Option<Addr>,
    rpc_id: u64,
    target_context_id: u8,
    cookie: u64,
    input: Vec<u8>,
    output: Vec<u8>,
    more_data: bool,
    more_data_acquired: bool,
    no_response: bool,
    op_id: Option<OpId>,
}

/// An in-flight or reusable RPC handle. Client-created handles start
/// empty (`HgClass::create`); server-received handles arrive already
/// populated with the decoded request (`HgContext::context_post`'s
/// internal dispatch).
pub struct HgHandle {
    state: AtomicU8,
    inner: Mutex<Mutable>,
    forward_cb: Mutex<Option<Box<dyn FnOnce(Result<(), HgError>) + Send>>>,
    owner: Mutex<Option<Arc<HgContext>>>,
}

impl HgHandle {
    pub(crate) fn new_created() -> Self {
        HgHandle {
            state: AtomicU8::new(HandleState::Created as u8),
            inner: Mutex::new(Mutable {
                target: None,
                rpc_id: 0,
                target_context_id: 0,
                cookie: 0,
                input: Vec::new(),
                output: Vec::new(),
                more_data: false,
                more_data_acquired: false,
                no_response: false,
                op_id: None,
            }),
            forward_cb: Mutex::new(None),
            owner: Mutex::new(None),
        }
    }

    /// `HG_Core_get_info`'s context pointer: the context this handle was
    /// created or received on, so an RPC callback can call `respond`
    /// from nothing but the handle it was given.
    pub fn owner(&self) -> Option<Arc<HgContext>> {
        self.owner.lock().unwrap().clone()
    }

    pub(crate) fn set_owner(&self, owner: Arc<HgContext>) {
        *self.owner.lock().unwrap() = Some(owner);
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: HandleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn rpc_id(&self) -> u64 {
        self.inner.lock().unwrap().rpc_id
    }

    pub fn cookie(&self) -> u64 {
        self.inner.lock().unwrap().cookie
    }

    pub fn target_context_id(&self) -> u8 {
        self.inner.lock().unwrap().target_context_id
    }

    pub fn more_data(&self) -> bool {
        self.inner.lock().unwrap().more_data
    }

    /// `HG_Core_set_more_data`: marks a client handle's input as an
    /// out-of-band bulk transfer too large for the eager buffer, so
    /// `forward` sets `FLAG_MORE_DATA` on the wire; only legal in
    /// `Created`.
    pub fn set_more_data(&self, flag: bool) -> Result<(), HgError> {
        if self.state() != HandleState::Created {
            return Err(HgError::InvalidHandleState);
        }
        self.inner.lock().unwrap().more_data = flag;
        Ok(())
    }

    /// Whether the class-wide more-data acquire callback has already run
    /// for this handle, so `Drop` knows whether a matching release is owed.
    pub(crate) fn more_data_acquired(&self) -> bool {
        self.inner.lock().unwrap().more_data_acquired
    }

    pub(crate) fn mark_more_data_acquired(&self) {
        self.inner.lock().unwrap().more_data_acquired = true;
    }

    pub fn no_response(&self) -> bool {
        self.inner.lock().unwrap().no_response
    }

    pub fn target(&self) -> Option<Addr> {
        self.inner.lock().unwrap().target.clone()
    }

    pub fn input(&self) -> Vec<u8> {
        self.inner.lock().unwrap().input.clone()
    }

    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().unwrap().output.clone()
    }

    /// Sets the input eager buffer; only legal in `Created`.
    pub fn set_input(&self, buf: Vec<u8>) -> Result<(), HgError> {
        if self.state() != HandleState::Created {
            return Err(HgError::InvalidHandleState);
        }
        self.inner.lock().unwrap().input = buf;
        Ok(())
    }

    /// Sets the output eager buffer, written by the RPC callback before
    /// `respond`; only legal in `Created`.
    pub fn set_output(&self, buf: Vec<u8>) -> Result<(), HgError> {
        if self.state() != HandleState::Created {
            return Err(HgError::InvalidHandleState);
        }
        self.inner.lock().unwrap().output = buf;
        Ok(())
    }

    /// Stores the decoded response payload once a forward's response has
    /// arrived, bypassing the `Created`-only guard `set_output` enforces
    /// for caller-supplied buffers.
    pub(crate) fn store_output(&self, buf: Vec<u8>) {
        self.inner.lock().unwrap().output = buf;
    }

    pub(crate) fn set_forward_cb(&self, cb: Box<dyn FnOnce(Result<(), HgError>) + Send>) {
        *self.forward_cb.lock().unwrap() = Some(cb);
    }

    pub(crate) fn take_forward_cb(&self) -> Option<Box<dyn FnOnce(Result<(), HgError>) + Send>> {
        self.forward_cb.lock().unwrap().take()
    }

    /// `HG_Core_set_target_id`: route to a sibling context on the
    /// target by its context id, for multi-context servers.
    pub fn set_target(&self, target: Addr, rpc_id: u64, target_context_id: u8, no_response: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.target = Some(target);
        inner.rpc_id = rpc_id;
        inner.target_context_id = target_context_id;
        inner.no_response = no_response;
    }

    pub(crate) fn set_from_request(&self, source: Addr, rpc_id: u64, cookie: u64, more_data: bool, no_response: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.target = Some(source);
        inner.rpc_id = rpc_id;
        inner.cookie = cookie;
        inner.more_data = more_data;
        inner.no_response = no_response;
    }

    pub(crate) fn assign_cookie(&self, cookie: u64) {
        self.inner.lock().unwrap().cookie = cookie;
    }

    pub(crate) fn set_op_id(&self, op_id: Option<OpId>) {
        self.inner.lock().unwrap().op_id = op_id;
    }

    pub(crate) fn op_id(&self) -> Option<OpId> {
        self.inner.lock().unwrap().op_id
    }

    /// `HG_Core_reset`: only legal with no other references outstanding
    /// and nothing in flight. Clears the routing/correlation fields back
    /// to a fresh `Created` handle the caller can `forward` again, but
    /// leaves `input`/`output` untouched -- reset preserves buffer
    /// identities and sizes, so `get_input`/`get_output` after reset
    /// still see whatever was there before it.
    pub(crate) fn reset_fields(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.target = None;
        inner.rpc_id = 0;
        inner.target_context_id = 0;
        inner.cookie = 0;
        inner.more_data = false;
        inner.more_data_acquired = false;
        inner.no_response = false;
        inner.op_id = None;
        drop(inner);
        *self.forward_cb.lock().unwrap() = None;
        self.set_state(HandleState::Created);
    }
}

impl Drop for HgHandle {
    /// Runs the class-wide more-data release hook exactly once, for
    /// handles whose acquire hook actually ran (spec.md §4.4) -- this is
    /// "handle destroy" in a crate where destroy is just the last `Arc`
    /// dropping, so there is no separate `HG_Core_destroy` call site to
    /// hang this off of.
    fn drop(&mut self) {
        if !self.more_data_acquired() {
            return;
        }
        if let Some(owner) = self.owner() {
            if let Some(release) = owner.class().more_data_release_hook() {
                release(self);
            }
        }
    }
}
