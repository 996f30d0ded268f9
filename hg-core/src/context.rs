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

//! HG-Core context: posting of unexpected-receive slots that listen for
//! incoming RPC requests, and the `forward`/`respond` request/response
//! exchange built on top of an NA context (spec.md §4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use na_core::{Context as NaContext, NaError, NaResult, TriggerOutcome, UnexpectedRecv};

use crate::class::HgClass;
use crate::error::{HgError, HgResult};
use crate::handle::{HandleState, HgHandle};
use crate::header::{RequestHeader, ResponseHeader, FLAG_MORE_DATA, FLAG_NO_RESPONSE};

type HandleCreateHook = dyn Fn(&Arc<HgHandle>) + Send + Sync;

pub struct HgContext {
    hg_class: Arc<HgClass>,
    na_context: Arc<NaContext>,
    handle_create_hook: Mutex<Option<Arc<HandleCreateHook>>>,
    repost: AtomicBool,
}

impl HgContext {
    /// `HG_Core_context_create`/`_create_id`.
    pub fn create(hg_class: &Arc<HgClass>, ctx_id: Option<u8>) -> HgResult<Arc<Self>> {
        let na_context = hg_class.na_class.context_create(ctx_id)?;
        Ok(Arc::new(HgContext {
            hg_class: Arc::clone(hg_class),
            na_context,
            handle_create_hook: Mutex::new(None),
            repost: AtomicBool::new(true),
        }))
    }

    /// `HG_Core_context_destroy`.
    pub fn destroy(self: Arc<Self>) -> HgResult<()> {
        self.hg_class.na_class.context_destroy(Arc::clone(&self.na_context))?;
        Ok(())
    }

    pub fn id(&self) -> Option<u8> {
        self.na_context.ctx_id()
    }

    pub fn class(&self) -> &Arc<HgClass> {
        &self.hg_class
    }

    /// `HG_Core_context_set_handle_create_callback`: lets the owner
    /// attach data to every handle as it is created, client- or
    /// server-side.
    pub fn set_handle_create_callback<F>(&self, hook: F)
    where
        F: Fn(&Arc<HgHandle>) + Send + Sync + 'static,
    {
        *self.handle_create_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// `HG_Core_create`: a fresh, empty client-side handle.
    pub fn create(self: &Arc<Self>) -> Arc<HgHandle> {
        let handle = Arc::new(HgHandle::new_created());
        handle.set_owner(Arc::clone(self));
        self.run_create_hook(&handle);
        handle
    }

    fn run_create_hook(&self, handle: &Arc<HgHandle>) {
        if let Some(hook) = &*self.handle_create_hook.lock().unwrap() {
            hook(handle);
        }
    }

    /// `HG_Core_reset`: only legal with exactly one reference outstanding
    /// and nothing in flight.
    pub fn reset(&self, handle: &Arc<HgHandle>) -> HgResult<()> {
        if Arc::strong_count(handle) != 1 {
            return Err(HgError::Busy);
        }
        if handle.state() == HandleState::Posted {
            return Err(HgError::InvalidHandleState);
        }
        handle.reset_fields();
        Ok(())
    }

    pub fn ref_incr(handle: &Arc<HgHandle>) -> Arc<HgHandle> {
        Arc::clone(handle)
    }

    pub fn ref_get(handle: &Arc<HgHandle>) -> usize {
        Arc::strong_count(handle)
    }

    /// `HG_Core_destroy`: refuses while another reference is alive,
    /// matching the refcount discipline `HG_Core_ref_incr` establishes.
    pub fn destroy_handle(handle: Arc<HgHandle>) -> HgResult<()> {
        if Arc::strong_count(&handle) != 1 {
            return Err(HgError::Busy);
        }
        drop(handle);
        Ok(())
    }

    pub fn cancel(&self, handle: &Arc<HgHandle>) -> HgResult<()> {
        let op_id = handle.op_id().ok_or(HgError::InvalidHandleState)?;
        self.hg_class.na_class.cancel(&self.na_context, op_id).map_err(HgError::from)
    }

    pub fn progress(self: &Arc<Self>, timeout_ms: u32) -> HgResult<()> {
        self.na_context.progress(timeout_ms).map_err(HgError::from)
    }

    pub fn trigger(&self, timeout_ms: u32, max_count: u32) -> TriggerOutcome {
        self.na_context.trigger(timeout_ms, max_count)
    }

    /// `HG_Core_context_post`: posts `count` unexpected-receive slots.
    /// When `repost` is true, each slot re-posts itself as soon as it is
    /// consumed, so the context keeps listening indefinitely once this
    /// has been called once with a non-zero count; when `repost` is
    /// false, `count` is a one-shot batch and the context stops
    /// listening for unexpected messages once every posted slot has
    /// fired (spec.md §4.5).
    pub fn context_post(self: &Arc<Self>, count: usize, repost: bool) -> HgResult<()> {
        self.repost.store(repost, Ordering::Relaxed);
        for _ in 0..count {
            self.post_one_unexpected_recv()?;
        }
        Ok(())
    }

    fn post_one_unexpected_recv(self: &Arc<Self>) -> HgResult<()> {
        let buf_size = self.hg_class.na_class.unexpected_size_max();
        let buf = self.hg_class.na_class.msg_buf_alloc(buf_size);
        let op_id = self.hg_class.na_class.op_create();
        let this = Arc::clone(self);
        self.hg_class
            .na_class
            .plugin()
            .msg_recv_unexpected(&self.na_context, buf, op_id, Box::new(move |result| this.on_unexpected_recv(result)))
            .map_err(HgError::from)
    }

    fn on_unexpected_recv(self: Arc<Self>, result: NaResult<UnexpectedRecv>) {
        // Keep listening regardless of outcome -- a single dropped or
        // canceled slot must not starve the server of future requests --
        // unless the context was posted as a fixed one-shot batch.
        if self.repost.load(Ordering::Relaxed) && !matches!(result, Err(NaError::Canceled)) {
            if let Err(e) = self.post_one_unexpected_recv() {
                warn!("hg-core: failed to re-post unexpected recv slot: {e}");
            }
        }

        let recv = match result {
            Ok(recv) => recv,
            Err(NaError::Canceled) => return,
            Err(e) => {
                warn!("hg-core: unexpected recv failed: {e}");
                return;
            }
        };

        let header = match RequestHeader::from_bytes(&recv.buf) {
            Some(h) => h,
            None => {
                warn!("hg-core: dropped malformed request header from {:?}", recv.source);
                return;
            }
        };
        let payload = recv.buf[RequestHeader::WIRE_SIZE..].to_vec();

        let handle = Arc::new(HgHandle::new_created());
        handle.set_owner(Arc::clone(&self));
        handle.set_from_request(recv.source, header.rpc_id, header.cookie, header.has_more_data(), !header.wants_response());
        if handle.set_input(payload).is_err() {
            warn!("hg-core: handle not in Created state right after construction (unreachable)");
            return;
        }
        self.run_create_hook(&handle);

        if header.has_more_data() {
            self.dispatch_with_more_data(handle, header.wants_response());
        } else {
            self.dispatch_to_registry(handle, header.wants_response());
        }
    }

    /// A request that set `FLAG_MORE_DATA` routes through the class-wide
    /// acquire upcall (spec.md §4.4) before the RPC callback ever sees
    /// it; a class with no more-data hooks registered can't complete the
    /// out-of-band transfer, so the request is rejected with
    /// `ProtocolError` rather than silently handed a truncated buffer.
    fn dispatch_with_more_data(self: Arc<Self>, handle: Arc<HgHandle>, wants_response: bool) {
        let acquire = match self.hg_class.more_data_acquire_hook() {
            Some(acquire) => acquire,
            None => {
                warn!("hg-core: request set MoreData but no more_data callback is registered for this class");
                if wants_response {
                    let _ = self.respond_internal(&handle, HgError::Na(NaError::ProtocolError).to_status(), Box::new(|_| {}));
                }
                return;
            }
        };
        handle.mark_more_data_acquired();
        let this = Arc::clone(&self);
        let handle_for_done = Arc::clone(&handle);
        acquire(handle, Box::new(move |result| this.on_more_data_acquired(handle_for_done, wants_response, result)));
    }

    /// The acquire hook's done-continuation: its result propagates as
    /// the handle's completion status (spec.md §4.4) -- the acquire path
    /// is not retried by the core.
    fn on_more_data_acquired(self: Arc<Self>, handle: Arc<HgHandle>, wants_response: bool, result: HgResult<()>) {
        match result {
            Ok(()) => self.dispatch_to_registry(handle, wants_response),
            Err(e) => {
                warn!("hg-core: more_data acquire failed: {e}");
                if wants_response {
                    let _ = self.respond_internal(&handle, e.to_status(), Box::new(|_| {}));
                }
            }
        }
    }

    fn dispatch_to_registry(self: Arc<Self>, handle: Arc<HgHandle>, wants_response: bool) {
        let rpc_id = handle.rpc_id();
        match self.hg_class.registry.callback(rpc_id) {
            Some(rpc_cb) => rpc_cb(handle),
            None => {
                warn!("hg-core: no RPC registered for id {}", rpc_id);
                if wants_response {
                    let _ = self.respond_internal(&handle, HgError::NoMatch.to_status(), Box::new(|_| {}));
                }
            }
        }
    }

    /// `HG_Core_forward`: sends the handle's input as an unexpected
    /// message, then -- unless the caller set `no_response` -- pre-posts
    /// an expected receive keyed by this forward's cookie and only
    /// resolves `on_complete` once the matching response has arrived.
    pub fn forward(self: &Arc<Self>, handle: &Arc<HgHandle>, on_complete: Box<dyn FnOnce(HgResult<()>) + Send>) -> HgResult<()> {
        if handle.state() != HandleState::Created {
            return Err(HgError::InvalidHandleState);
        }
        let input = handle.input();
        if input.len() > self.hg_class.input_eager_size() {
            return Err(HgError::Na(NaError::InvalidParam));
        }
        let target = handle.target().ok_or(HgError::InvalidHandleState)?;
        let cookie = self.hg_class.alloc_cookie();
        handle.assign_cookie(cookie);

        let mut flags = 0u8;
        if handle.no_response() {
            flags |= FLAG_NO_RESPONSE;
        }
        if handle.more_data() {
            flags |= FLAG_MORE_DATA;
        }
        let header = RequestHeader { rpc_id: handle.rpc_id(), flags, target_context_id: handle.target_context_id(), cookie };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(&handle.input());

        handle.set_state(HandleState::Posted);
        let op_id = self.hg_class.na_class.op_create();
        handle.set_op_id(Some(op_id));

        let wants_response = !handle.no_response();
        let this = Arc::clone(self);
        let handle_for_cb = Arc::clone(handle);
        self.hg_class
            .na_class
            .plugin()
            .msg_send_unexpected(
                &self.na_context,
                &target,
                buf,
                op_id,
                Box::new(move |result| this.on_forward_send_complete(handle_for_cb, wants_response, result, on_complete)),
            )
            .map_err(HgError::from)
    }

    fn on_forward_send_complete(
        self: Arc<Self>,
        handle: Arc<HgHandle>,
        wants_response: bool,
        result: NaResult<()>,
        on_complete: Box<dyn FnOnce(HgResult<()>) + Send>,
    ) {
        if let Err(e) = result {
            handle.set_state(HandleState::Completed);
            on_complete(Err(HgError::from(e)));
            return;
        }
        if !wants_response {
            handle.set_state(HandleState::Completed);
            on_complete(Ok(()));
            return;
        }

        handle.set_forward_cb(on_complete);
        let cookie = handle.cookie();
        let target = match handle.target() {
            Some(t) => t,
            None => {
                handle.set_state(HandleState::Completed);
                if let Some(cb) = handle.take_forward_cb() {
                    cb(Err(HgError::InvalidHandleState));
                }
                return;
            }
        };
        let recv_buf = self.hg_class.na_class.msg_buf_alloc(self.hg_class.na_class.expected_size_max());
        let op_id = self.hg_class.na_class.op_create();
        handle.set_op_id(Some(op_id));

        let this = Arc::clone(&self);
        let handle_for_cb = Arc::clone(&handle);
        let send_result = self.hg_class.na_class.plugin().msg_recv_expected(
            &self.na_context,
            &target,
            cookie,
            recv_buf,
            op_id,
            Box::new(move |result| this.on_forward_response(handle_for_cb, result)),
        );
        if let Err(e) = send_result {
            handle.set_state(HandleState::Completed);
            if let Some(cb) = handle.take_forward_cb() {
                cb(Err(HgError::from(e)));
            }
        }
    }

    fn on_forward_response(self: Arc<Self>, handle: Arc<HgHandle>, result: NaResult<Vec<u8>>) {
        handle.set_state(HandleState::Completed);
        let cb = match handle.take_forward_cb() {
            Some(cb) => cb,
            None => return,
        };
        match result {
            Ok(buf) => match ResponseHeader::from_bytes(&buf) {
                Some(header) => {
                    handle.store_output(buf[ResponseHeader::WIRE_SIZE..].to_vec());
                    match HgError::from_status(header.status) {
                        None => cb(Ok(())),
                        Some(err) => cb(Err(err)),
                    }
                }
                None => cb(Err(HgError::Na(NaError::ProtocolError))),
            },
            Err(e) => cb(Err(HgError::from(e))),
        }
    }

    /// `HG_Core_respond`: sends the handle's output as an expected
    /// message tagged with the request's cookie. A request carrying
    /// `NoResponse` never gets one posted for it (spec.md §8 scenario F)
    /// -- responding to it is rejected outright rather than silently
    /// accepted.
    pub fn respond(self: &Arc<Self>, handle: &Arc<HgHandle>, on_complete: Box<dyn FnOnce(HgResult<()>) + Send>) -> HgResult<()> {
        if handle.no_response() {
            return Err(HgError::InvalidHandleState);
        }
        self.respond_internal(handle, 0, on_complete)
    }

    fn respond_internal(self: &Arc<Self>, handle: &Arc<HgHandle>, status: i32, on_complete: Box<dyn FnOnce(HgResult<()>) + Send>) -> HgResult<()> {
        if handle.state() != HandleState::Created {
            return Err(HgError::InvalidHandleState);
        }
        let target = handle.target().ok_or(HgError::InvalidHandleState)?;

        let flags = if handle.more_data() { FLAG_MORE_DATA } else { 0 };
        let header = ResponseHeader { cookie: handle.cookie(), flags, status };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(&handle.output());

        handle.set_state(HandleState::Posted);
        let op_id = self.hg_class.na_class.op_create();
        handle.set_op_id(Some(op_id));
        let handle_for_cb = Arc::clone(handle);
        let cookie = handle.cookie();
        self.hg_class
            .na_class
            .plugin()
            .msg_send_expected(
                &self.na_context,
                &target,
                cookie,
                buf,
                op_id,
                Box::new(move |result| {
                    handle_for_cb.set_state(HandleState::Completed);
                    on_complete(result.map_err(HgError::from));
                }),
            )
            .map_err(HgError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_core::PluginRegistry;
    use na_sm::SmPlugin;

    fn registry() -> PluginRegistry {
        PluginRegistry::new().with_plugin(Arc::new(SmPlugin))
    }

    fn client_context(name: &str) -> Arc<HgContext> {
        let class = HgClass::init(&registry(), &format!("sm://{name}"), true, na_core::ProgressMode::NoBlock).unwrap();
        HgContext::create(&class, None).unwrap()
    }

    #[test]
    fn ref_incr_and_ref_get_track_strong_count() {
        let ctx = client_context("ctx-refcount");
        let handle = ctx.create();
        assert_eq!(HgContext::ref_get(&handle), 1);
        let dup = HgContext::ref_incr(&handle);
        assert_eq!(HgContext::ref_get(&handle), 2);
        drop(dup);
        assert_eq!(HgContext::ref_get(&handle), 1);
    }

    #[test]
    fn reset_refuses_while_another_reference_is_outstanding() {
        let ctx = client_context("ctx-reset-busy");
        let handle = ctx.create();
        let _extra = Arc::clone(&handle);
        assert_eq!(ctx.reset(&handle).unwrap_err(), HgError::Busy);
    }

    #[test]
    fn reset_refuses_while_posted() {
        let ctx = client_context("ctx-reset-posted");
        let handle = ctx.create();
        handle.set_state(HandleState::Posted);
        assert_eq!(ctx.reset(&handle).unwrap_err(), HgError::InvalidHandleState);
    }

    #[test]
    fn reset_succeeds_on_a_sole_created_reference() {
        let ctx = client_context("ctx-reset-ok");
        let handle = ctx.create();
        handle.set_input(vec![1, 2, 3]).unwrap();
        ctx.reset(&handle).unwrap();
        // reset preserves buffer identities and sizes (spec.md §8 invariant 3).
        assert_eq!(handle.input(), vec![1, 2, 3]);
        assert_eq!(handle.state(), HandleState::Created);
    }

    #[test]
    fn destroy_handle_refuses_while_another_reference_is_outstanding() {
        let ctx = client_context("ctx-destroy-busy");
        let handle = ctx.create();
        let extra = Arc::clone(&handle);
        assert_eq!(HgContext::destroy_handle(handle).unwrap_err(), HgError::Busy);
        drop(extra);
    }

    #[test]
    fn created_handles_are_owned_by_the_creating_context() {
        let ctx = client_context("ctx-owner");
        let handle = ctx.create();
        assert!(handle.owner().is_some());
    }

    #[test]
    fn forward_rejects_input_larger_than_the_eager_size() {
        let ctx = client_context("ctx-forward-oversize");
        let handle = ctx.create();
        let dest = ctx.hg_class.na().addr_self().unwrap();
        handle.set_target(dest, 0x1, 0, false);
        let oversized = vec![0u8; ctx.hg_class.input_eager_size() + 1];
        handle.set_input(oversized).unwrap();

        assert_eq!(ctx.forward(&handle, Box::new(|_| {})).unwrap_err(), HgError::Na(NaError::InvalidParam));
        assert_eq!(handle.state(), HandleState::Created);
    }

    #[test]
    fn respond_is_rejected_on_a_no_response_handle() {
        let ctx = client_context("ctx-no-response-respond");
        let handle = ctx.create();
        let dest = ctx.hg_class.na().addr_self().unwrap();
        handle.set_target(dest, 0x1, 0, true);

        assert_eq!(ctx.respond(&handle, Box::new(|_| {})).unwrap_err(), HgError::InvalidHandleState);
        assert_eq!(handle.state(), HandleState::Created);
    }
}
