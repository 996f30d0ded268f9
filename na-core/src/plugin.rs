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

//! The plugin vtable (§6) and the opaque handle types (§3) a plugin
//! hands back to the core: addresses, memory handles, operation ids.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::NaResult;
use crate::info::AddrInfo;

/// Opaque token returned by async lookups and by forward/respond; the
/// sole legal subject of `cancel`. A plugin is free to mint these
/// however it likes (a counter, a pointer cast, ...); the core never
/// inspects the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

/// Per-class monotonic allocator for `OpId`s. Plugins that have no
/// internal id scheme of their own can use this; plugins that do
/// (`op_create`/`op_destroy` is optional at the class level, per §4.3)
/// are free to ignore it and mint their own tokens.
#[derive(Default)]
pub struct OpIdAllocator(std::sync::atomic::AtomicU64);

impl OpIdAllocator {
    pub fn alloc(&self) -> OpId {
        OpId(self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// Plugin-private peer state backing an [`Addr`]. Implemented by each
/// plugin for its own address representation.
pub trait AddrPayload: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// An address handle. Reference-counted by convention: `lookup`/`dup`/
/// `self` all hand back a fresh owning reference (here, a fresh `Arc`
/// clone), and the peer state is torn down when the last reference
/// drops. This maps the spec's "must be freed exactly once" directly
/// onto Rust's ownership model rather than a plugin-visible free hook.
#[derive(Clone)]
pub struct Addr {
    payload: Arc<dyn AddrPayload>,
    owner: &'static str,
}

impl Addr {
    pub fn new(owner: &'static str, payload: Arc<dyn AddrPayload>) -> Self {
        Addr { payload, owner }
    }

    pub fn payload(&self) -> &Arc<dyn AddrPayload> {
        &self.payload
    }

    /// Name of the plugin that owns this address, used to prepend the
    /// `class+` prefix in `addr_to_string`.
    pub fn owner(&self) -> &'static str {
        self.owner
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr").field("owner", &self.owner).field("payload", &self.payload).finish()
    }
}

/// Plugin-private registered-memory-region state backing a [`MemHandle`].
pub trait MemPayload: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Opaque handle to a registered memory region used as a bulk source or
/// sink. Lifecycle (create -> register -> publish -> unpublish ->
/// deregister -> free) is entirely plugin-delegated; see [`NaClassOps`].
#[derive(Clone)]
pub struct MemHandle(pub Arc<dyn MemPayload>);

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemHandle").field(&self.0).finish()
    }
}

/// A plugin descriptor: a factory that, given parsed address info,
/// produces the per-class vtable implementation. One instance per
/// compiled-in transport driver, registered into a [`crate::registry::PluginRegistry`].
pub trait NaPlugin: Send + Sync {
    /// The class name used for `class+protocol` selection, e.g. `"sm"`.
    fn name(&self) -> &'static str;

    /// Whether this plugin can drive the given bare protocol name.
    fn check_protocol(&self, protocol: &str) -> bool;

    /// Initializes a new class instance bound to this plugin.
    fn initialize(&self, info: &AddrInfo, listen: bool) -> NaResult<NaClassHandle>;

    /// Process-wide static cleanup hook, invoked by
    /// [`crate::registry::PluginRegistry::cleanup_all`]. Most plugins
    /// have nothing to do here.
    fn cleanup(&self) {}
}

pub type NaClassHandle = Arc<dyn NaClassOps>;

/// The per-class plugin vtable. One instance is created by
/// [`NaPlugin::initialize`] and lives for the lifetime of the owning
/// `NaClass`.
///
/// Methods are grouped as in spec.md §6. Anything marked "optional"
/// there gets a default implementation here; plugins override only
/// what they actually support.
pub trait NaClassOps: Send + Sync {
    // -- lifecycle -----------------------------------------------------
    fn finalize(&self) -> NaResult<()>;

    /// Optional: let the plugin set up per-context state. `context` is
    /// already fully constructed by `na-core`; plugins that need a
    /// bookkeeping slot key it off `Arc::as_ptr(context)`.
    fn context_create(&self, _context: &Arc<Context>) -> NaResult<()> {
        Ok(())
    }
    fn context_destroy(&self, _context: &Arc<Context>) -> NaResult<()> {
        Ok(())
    }

    // -- addressing ------------------------------------------------------
    /// Async address resolution. On completion the plugin must push a
    /// completion record onto `context` carrying the resolved `Addr`
    /// (or a failure status) for the given `op_id`.
    fn addr_lookup(
        &self,
        context: &Arc<Context>,
        name: &str,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<Addr>) + Send>,
    ) -> NaResult<()>;

    /// Optional synchronous lookup. Default: unsupported, per spec.md
    /// §9's stricter-than-Mercury treatment of a missing sync lookup.
    fn addr_lookup2(&self, _name: &str) -> NaResult<Addr> {
        Err(crate::error::NaError::ProtocolError)
    }

    fn addr_self(&self) -> NaResult<Addr>;

    /// Whether this plugin's `addr_to_string` output is already
    /// globally unique without a `class+` prefix (the `mpi` exemption).
    fn addr_is_globally_unique(&self) -> bool {
        false
    }

    fn addr_to_string(&self, addr: &Addr) -> NaResult<String>;
    fn addr_serialize(&self, addr: &Addr) -> NaResult<Vec<u8>>;
    fn addr_deserialize(&self, buf: &[u8]) -> NaResult<Addr>;

    /// Tell the plugin a peer is presumed dead; drop cached state.
    fn addr_set_remove(&self, _addr: &Addr) -> NaResult<()> {
        Ok(())
    }

    // -- message buffers ---------------------------------------------
    fn msg_buf_alloc(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }
    fn msg_buf_free(&self, _buf: Vec<u8>) {}

    fn unexpected_size_max(&self) -> usize;
    fn expected_size_max(&self) -> usize;
    fn unexpected_header_size(&self) -> usize {
        0
    }
    fn expected_header_size(&self) -> usize {
        0
    }

    // -- messaging -------------------------------------------------------
    /// Send `buf` as an unexpected message (carries an RPC request).
    fn msg_send_unexpected(
        &self,
        context: &Arc<Context>,
        dest: &Addr,
        buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<()>) + Send>,
    ) -> NaResult<()>;

    /// Post a slot to receive the next unexpected message.
    fn msg_recv_unexpected(
        &self,
        context: &Arc<Context>,
        buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<UnexpectedRecv>) + Send>,
    ) -> NaResult<()>;

    /// Send `buf` as an expected message (carries an RPC response) to
    /// the pre-posted receive matching `tag` on the peer.
    fn msg_send_expected(
        &self,
        context: &Arc<Context>,
        dest: &Addr,
        tag: u64,
        buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<()>) + Send>,
    ) -> NaResult<()>;

    /// Pre-post an expected receive matching `tag` from `src`.
    fn msg_recv_expected(
        &self,
        context: &Arc<Context>,
        src: &Addr,
        tag: u64,
        buf: Vec<u8>,
        op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<Vec<u8>>) + Send>,
    ) -> NaResult<()>;

    // -- registered memory ----------------------------------------------
    fn mem_handle_create(&self, buf: &[u8]) -> NaResult<MemHandle>;
    fn mem_handle_free(&self, _handle: MemHandle) {}
    fn mem_register(&self, _handle: &MemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_deregister(&self, _handle: &MemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_publish(&self, _handle: &MemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_unpublish(&self, _handle: &MemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_handle_serialize(&self, handle: &MemHandle) -> NaResult<Vec<u8>>;
    fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<MemHandle>;

    // -- cancellation & progress ------------------------------------------
    fn cancel(&self, context: &Arc<Context>, op_id: OpId) -> NaResult<()>;

    /// Drive the plugin's own event sources for up to `timeout_ms`.
    /// Returns `Ok(())` if something completed, `Err(Timeout)` if the
    /// budget elapsed with nothing to report.
    fn progress(&self, context: &Arc<Context>, timeout_ms: u32) -> NaResult<()>;

    /// Advisory: can the caller safely sleep on this plugin's
    /// underlying descriptor without missing pending unexpected work?
    fn poll_try_wait(&self, _context: &Arc<Context>) -> bool {
        true
    }
}

/// What an unexpected-receive completion hands back: the payload plus
/// the peer address it arrived from (the plugin resolves this from the
/// wire, e.g. from a socket's peer address).
pub struct UnexpectedRecv {
    pub buf: Vec<u8>,
    pub source: Addr,
}
