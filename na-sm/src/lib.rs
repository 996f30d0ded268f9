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

//! `na-sm`: an in-process loopback NA plugin.
//!
//! Stands in for the "shared-memory-first" plugin the original registry
//! always lists ahead of others (spec.md §4.1): a same-host, same-process
//! transport with no real fabric underneath, used both to exercise the
//! vtable end to end and to back the demo binary and the test suite.
//!
//! Because all work here is effectively instantaneous (a directory
//! lookup, a `Vec` copy, a hash-map insert), every operation resolves
//! synchronously inside its own call and pushes its completion record
//! immediately; `progress` has nothing left to do and always reports
//! `Timeout`, relying on `na_core::Context::progress`'s queue-check
//! fast path (step 4 of the progress contract) to short-circuit before
//! ever calling it.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace};

use na_core::{
    Addr, AddrInfo, AddrPayload, CompletionRecord, Context, MemHandle, MemPayload, NaClassHandle,
    NaClassOps, NaError, NaPlugin, NaResult, OpId, UnexpectedRecv,
};

type DirectoryMap = HashMap<String, Arc<SmEndpoint>>;

fn directory() -> &'static Mutex<DirectoryMap> {
    static DIRECTORY: OnceLock<Mutex<DirectoryMap>> = OnceLock::new();
    DIRECTORY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_marker() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct PendingUnexpected {
    op_id: OpId,
    cb: Box<dyn FnOnce(NaResult<UnexpectedRecv>) + Send>,
    ctx: Arc<Context>,
}

struct PendingExpected {
    op_id: OpId,
    cb: Box<dyn FnOnce(NaResult<Vec<u8>>) + Send>,
    ctx: Arc<Context>,
}

/// Plugin-private peer state. Shared (via `Arc`) between every `Addr`
/// that names the same endpoint, so a sender always has a direct handle
/// to the receiver's mailboxes -- no secondary directory lookup needed
/// once an `Addr` has been resolved once.
pub struct SmEndpoint {
    name: Option<String>,
    marker: u64,
    unexpected_backlog: Mutex<VecDeque<(Vec<u8>, Addr)>>,
    unexpected_pending: Mutex<VecDeque<PendingUnexpected>>,
    expected_backlog: Mutex<HashMap<u64, Vec<u8>>>,
    expected_pending: Mutex<HashMap<u64, PendingExpected>>,
}

impl SmEndpoint {
    fn new(name: Option<String>) -> Self {
        SmEndpoint {
            name,
            marker: next_marker(),
            unexpected_backlog: Mutex::new(VecDeque::new()),
            unexpected_pending: Mutex::new(VecDeque::new()),
            expected_backlog: Mutex::new(HashMap::new()),
            expected_pending: Mutex::new(HashMap::new()),
        }
    }

    fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("anon-{}", self.marker),
        }
    }
}

impl fmt::Debug for SmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmEndpoint").field("name", &self.display_name()).finish()
    }
}

impl AddrPayload for SmEndpoint {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn endpoint_addr(endpoint: &Arc<SmEndpoint>) -> Addr {
    Addr::new("sm", Arc::clone(endpoint) as Arc<dyn AddrPayload>)
}

fn downcast_endpoint(addr: &Addr) -> NaResult<&SmEndpoint> {
    addr.payload().as_any().downcast_ref::<SmEndpoint>().ok_or(NaError::InvalidParam)
}

struct SmMemHandle {
    data: Mutex<Vec<u8>>,
}

impl fmt::Debug for SmMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmMemHandle").field("len", &self.data.lock().unwrap().len()).finish()
    }
}

impl MemPayload for SmMemHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory plugin descriptor. Register one instance per process, first
/// in the [`na_core::PluginRegistry`] so it wins bare-protocol
/// selection (the "sm-first" ordering contract).
#[derive(Default)]
pub struct SmPlugin;

/// Largest payload the loopback transport treats as eager. Chosen to be
/// comfortably larger than a request/response header; plugins backing
/// real fabrics would report their actual small-message limit here.
const UNEXPECTED_SIZE_MAX: usize = 4096;
const EXPECTED_SIZE_MAX: usize = 4096;

impl NaPlugin for SmPlugin {
    fn name(&self) -> &'static str {
        "sm"
    }

    fn check_protocol(&self, protocol: &str) -> bool {
        protocol == "sm"
    }

    fn initialize(&self, info: &AddrInfo, listen: bool) -> NaResult<NaClassHandle> {
        let endpoint = Arc::new(SmEndpoint::new(info.host_name.clone()));
        if listen {
            let key = info.host_name.clone().ok_or(NaError::InvalidParam)?;
            let mut dir = directory().lock().unwrap();
            if dir.contains_key(&key) {
                return Err(NaError::AddressInUse);
            }
            dir.insert(key, Arc::clone(&endpoint));
        }
        debug!("na-sm: initialized class, listen={} name={:?}", listen, info.host_name);
        Ok(Arc::new(SmClassOps { endpoint, listen, name: info.host_name.clone() }))
    }
}

struct SmClassOps {
    endpoint: Arc<SmEndpoint>,
    listen: bool,
    name: Option<String>,
}

impl NaClassOps for SmClassOps {
    fn finalize(&self) -> NaResult<()> {
        if self.listen {
            if let Some(name) = &self.name {
                directory().lock().unwrap().remove(name);
            }
        }
        Ok(())
    }

    fn addr_lookup(
        &self,
        context: &Arc<Context>,
        name: &str,
        _op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<Addr>) + Send>,
    ) -> NaResult<()> {
        let resolved = directory()
            .lock()
            .unwrap()
            .get(name)
            .map(endpoint_addr)
            .ok_or(NaError::NoMatch);
        context.completion_add(CompletionRecord::new(move || {
            on_complete(resolved);
            0
        }));
        Ok(())
    }

    fn addr_lookup2(&self, name: &str) -> NaResult<Addr> {
        directory().lock().unwrap().get(name).map(endpoint_addr).ok_or(NaError::NoMatch)
    }

    fn addr_self(&self) -> NaResult<Addr> {
        Ok(endpoint_addr(&self.endpoint))
    }

    fn addr_to_string(&self, addr: &Addr) -> NaResult<String> {
        Ok(downcast_endpoint(addr)?.display_name())
    }

    fn addr_serialize(&self, addr: &Addr) -> NaResult<Vec<u8>> {
        let endpoint = downcast_endpoint(addr)?;
        match &endpoint.name {
            Some(name) => Ok(name.clone().into_bytes()),
            None => Err(NaError::ProtocolError),
        }
    }

    fn addr_deserialize(&self, buf: &[u8]) -> NaResult<Addr> {
        let name = std::str::from_utf8(buf).map_err(|_| NaError::ProtocolError)?;
        directory().lock().unwrap().get(name).map(endpoint_addr).ok_or(NaError::NoMatch)
    }

    fn unexpected_size_max(&self) -> usize {
        UNEXPECTED_SIZE_MAX
    }

    fn expected_size_max(&self) -> usize {
        EXPECTED_SIZE_MAX
    }

    fn msg_send_unexpected(
        &self,
        context: &Arc<Context>,
        dest: &Addr,
        buf: Vec<u8>,
        _op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<()>) + Send>,
    ) -> NaResult<()> {
        if buf.len() > UNEXPECTED_SIZE_MAX {
            return Err(NaError::SizeError);
        }
        let dest_endpoint = downcast_endpoint(dest)?;
        let source = endpoint_addr(&self.endpoint);

        let mut pending = dest_endpoint.unexpected_pending.lock().unwrap();
        if let Some(waiter) = pending.pop_front() {
            drop(pending);
            trace!("na-sm: unexpected delivered directly to a pending receiver");
            waiter.ctx.completion_add(CompletionRecord::new(move || {
                (waiter.cb)(Ok(UnexpectedRecv { buf, source }));
                0
            }));
        } else {
            drop(pending);
            dest_endpoint.unexpected_backlog.lock().unwrap().push_back((buf, source));
        }

        context.completion_add(CompletionRecord::new(move || {
            on_complete(Ok(()));
            0
        }));
        Ok(())
    }

    fn msg_recv_unexpected(
        &self,
        context: &Arc<Context>,
        buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<UnexpectedRecv>) + Send>,
    ) -> NaResult<()> {
        let mut backlog = self.endpoint.unexpected_backlog.lock().unwrap();
        if let Some((payload, source)) = backlog.pop_front() {
            drop(backlog);
            let mut recv_buf = buf;
            if payload.len() > recv_buf.len() {
                context.completion_add(CompletionRecord::new(move || {
                    on_complete(Err(NaError::SizeError));
                    0
                }));
                return Ok(());
            }
            recv_buf[..payload.len()].copy_from_slice(&payload);
            recv_buf.truncate(payload.len());
            context.completion_add(CompletionRecord::new(move || {
                on_complete(Ok(UnexpectedRecv { buf: recv_buf, source }));
                0
            }));
        } else {
            drop(backlog);
            self.endpoint.unexpected_pending.lock().unwrap().push_back(PendingUnexpected {
                op_id,
                cb: on_complete,
                ctx: Arc::clone(context),
            });
        }
        Ok(())
    }

    fn msg_send_expected(
        &self,
        context: &Arc<Context>,
        dest: &Addr,
        tag: u64,
        buf: Vec<u8>,
        _op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<()>) + Send>,
    ) -> NaResult<()> {
        if buf.len() > EXPECTED_SIZE_MAX {
            return Err(NaError::SizeError);
        }
        let dest_endpoint = downcast_endpoint(dest)?;

        let mut pending = dest_endpoint.expected_pending.lock().unwrap();
        if let Some(waiter) = pending.remove(&tag) {
            drop(pending);
            waiter.ctx.completion_add(CompletionRecord::new(move || {
                (waiter.cb)(Ok(buf));
                0
            }));
        } else {
            drop(pending);
            dest_endpoint.expected_backlog.lock().unwrap().insert(tag, buf);
        }

        context.completion_add(CompletionRecord::new(move || {
            on_complete(Ok(()));
            0
        }));
        Ok(())
    }

    fn msg_recv_expected(
        &self,
        context: &Arc<Context>,
        _src: &Addr,
        tag: u64,
        _buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<Vec<u8>>) + Send>,
    ) -> NaResult<()> {
        let mut backlog = self.endpoint.expected_backlog.lock().unwrap();
        if let Some(payload) = backlog.remove(&tag) {
            drop(backlog);
            context.completion_add(CompletionRecord::new(move || {
                on_complete(Ok(payload));
                0
            }));
        } else {
            drop(backlog);
            self.endpoint
                .expected_pending
                .lock()
                .unwrap()
                .insert(tag, PendingExpected { op_id, cb: on_complete, ctx: Arc::clone(context) });
        }
        Ok(())
    }

    fn mem_handle_create(&self, buf: &[u8]) -> NaResult<MemHandle> {
        Ok(MemHandle(Arc::new(SmMemHandle { data: Mutex::new(buf.to_vec()) })))
    }

    fn mem_handle_serialize(&self, handle: &MemHandle) -> NaResult<Vec<u8>> {
        let mem = handle.0.as_any().downcast_ref::<SmMemHandle>().ok_or(NaError::InvalidParam)?;
        Ok(mem.data.lock().unwrap().clone())
    }

    fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<MemHandle> {
        Ok(MemHandle(Arc::new(SmMemHandle { data: Mutex::new(buf.to_vec()) })))
    }

    fn cancel(&self, context: &Arc<Context>, op_id: OpId) -> NaResult<()> {
        {
            let mut pending = self.endpoint.unexpected_pending.lock().unwrap();
            if let Some(pos) = pending.iter().position(|p| p.op_id == op_id) {
                let waiter = pending.remove(pos).unwrap();
                drop(pending);
                context.completion_add(CompletionRecord::new(move || {
                    (waiter.cb)(Err(NaError::Canceled));
                    0
                }));
                return Ok(());
            }
        }
        {
            let mut pending = self.endpoint.expected_pending.lock().unwrap();
            let tag = pending.iter().find(|(_, p)| p.op_id == op_id).map(|(t, _)| *t);
            if let Some(tag) = tag {
                let waiter = pending.remove(&tag).unwrap();
                drop(pending);
                context.completion_add(CompletionRecord::new(move || {
                    (waiter.cb)(Err(NaError::Canceled));
                    0
                }));
                return Ok(());
            }
        }
        Err(NaError::InvalidParam)
    }

    fn progress(&self, _context: &Arc<Context>, _timeout_ms: u32) -> NaResult<()> {
        // All work resolves synchronously at the call site; see module
        // docs. There is never anything left for progress to find.
        Err(NaError::Timeout)
    }

    fn poll_try_wait(&self, _context: &Arc<Context>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_core::{NaClass, PluginRegistry, ProgressMode};
    use std::sync::Mutex as StdMutex;

    fn registry() -> PluginRegistry {
        PluginRegistry::new().with_plugin(Arc::new(SmPlugin))
    }

    #[test]
    fn lookup_resolves_a_listening_peer() {
        let registry = registry();
        let server = NaClass::initialize(&registry, "sm://lookup-test", true, ProgressMode::NoBlock).unwrap();
        let client = NaClass::initialize(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

        let context = client.context_create(None).unwrap();
        let found: Arc<StdMutex<Option<NaResult<Addr>>>> = Arc::new(StdMutex::new(None));
        let found2 = Arc::clone(&found);
        client
            .addr_lookup(&context, "lookup-test", Box::new(move |result| *found2.lock().unwrap() = Some(result)))
            .unwrap();

        let outcome = context.trigger(0, 1);
        assert_eq!(outcome.actual_count, 1);
        let resolved = found.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(client.addr_to_string(&resolved, None).unwrap(), "sm+lookup-test");

        server.finalize().unwrap();
    }

    #[test]
    fn unexpected_round_trip_delivers_payload() {
        let registry = registry();
        let server = NaClass::initialize(&registry, "sm://echo", true, ProgressMode::NoBlock).unwrap();
        let client = NaClass::initialize(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();
        let server_ctx = server.context_create(None).unwrap();
        let client_ctx = client.context_create(None).unwrap();

        let dest = client.addr_lookup2("echo").unwrap();

        let recv_buf = server.msg_buf_alloc(64);
        let received: Arc<StdMutex<Option<Vec<u8>>>> = Arc::new(StdMutex::new(None));
        let received2 = Arc::clone(&received);
        server
            .plugin()
            .msg_recv_unexpected(
                &server_ctx,
                recv_buf,
                server.op_create(),
                Box::new(move |result| {
                    *received2.lock().unwrap() = Some(result.unwrap().buf);
                }),
            )
            .unwrap();

        client
            .plugin()
            .msg_send_unexpected(
                &client_ctx,
                &dest,
                b"hello sm".to_vec(),
                client.op_create(),
                Box::new(|result| result.unwrap()),
            )
            .unwrap();

        client_ctx.trigger(0, 1);
        server_ctx.trigger(0, 1);

        assert_eq!(received.lock().unwrap().take().unwrap(), b"hello sm");
    }
}
