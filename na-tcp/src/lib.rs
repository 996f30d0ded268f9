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

//! `na-tcp`: a real cross-host NA plugin over TCP, backed by `mio`.
//!
//! Wire framing is a small, NA-private detail (spec.md leaves wire
//! format up to the plugin, §6): every message is
//! `[kind: u8][tag: u64 if kind == EXPECTED][len: u32 BE][payload]`.
//! `kind` distinguishes an unexpected send (carries an RPC request) from
//! an expected send (carries a response matched by `tag`), mirroring the
//! two message classes threaded through `NaClassOps`.
//!
//! Connection setup is intentionally simple: `addr_lookup` only parses
//! and validates a `host:port` string, and the first send to a peer
//! opens (and caches) a connection lazily. Establishing the connection
//! itself is done with a blocking `std::net::TcpStream::connect` rather
//! than mio's non-blocking connect handshake -- a deliberate
//! simplification noted in `DESIGN.md`, since implementing the
//! writable-event connect completion adds real complexity for a demo
//! transport that sits beside a second, already-real plugin (`na-sm`).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use na_core::{
    Addr, AddrInfo, AddrPayload, CompletionRecord, Context, MemHandle, MemPayload, NaClassHandle,
    NaClassOps, NaError, NaPlugin, NaResult, OpId, UnexpectedRecv,
};

const LISTENER_TOKEN: Token = Token(0);
const UNEXPECTED_SIZE_MAX: usize = 64 * 1024;
const EXPECTED_SIZE_MAX: usize = 64 * 1024;

const KIND_UNEXPECTED: u8 = 0;
const KIND_EXPECTED: u8 = 1;

#[derive(Clone, Debug)]
struct TcpPeer {
    addr: SocketAddr,
}

impl AddrPayload for TcpPeer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn peer_addr(addr: &Addr) -> NaResult<SocketAddr> {
    Ok(addr.payload().as_any().downcast_ref::<TcpPeer>().ok_or(NaError::InvalidParam)?.addr)
}

fn make_addr(socket_addr: SocketAddr) -> Addr {
    Addr::new("tcp", Arc::new(TcpPeer { addr: socket_addr }))
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

/// Partially-read frame accumulator plus a queue of not-yet-flushed
/// outbound frames for one TCP connection.
struct ConnState {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: Vec<u8>,
    write_queue: VecDeque<Vec<u8>>,
}

impl ConnState {
    fn queue_frame(&mut self, frame: Vec<u8>) {
        self.write_queue.push_back(frame);
    }

    /// Best-effort flush; leaves partially-written frames queued for the
    /// next writable event.
    fn flush(&mut self) -> io::Result<()> {
        while let Some(frame) = self.write_queue.front() {
            match self.stream.write(frame) {
                Ok(n) if n == frame.len() => {
                    self.write_queue.pop_front();
                }
                Ok(n) => {
                    let mut remaining = self.write_queue.pop_front().unwrap();
                    remaining.drain(0..n);
                    self.write_queue.push_front(remaining);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads as much as is currently available and pulls complete frames
    /// out of the accumulator. Returns `Ok(false)` on a clean peer
    /// shutdown.
    fn read_available(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Parses as many complete frames as are currently buffered.
    fn drain_frames(&mut self) -> Vec<(u8, Option<u64>, Vec<u8>)> {
        let mut frames = Vec::new();
        loop {
            if self.read_buf.is_empty() {
                break;
            }
            let kind = self.read_buf[0];
            let header_len = match kind {
                KIND_EXPECTED => 1 + 8 + 4,
                _ => 1 + 4,
            };
            if self.read_buf.len() < header_len {
                break;
            }
            let tag = if kind == KIND_EXPECTED {
                Some(u64::from_be_bytes(self.read_buf[1..9].try_into().unwrap()))
            } else {
                None
            };
            let len_offset = if kind == KIND_EXPECTED { 9 } else { 1 };
            let len = u32::from_be_bytes(self.read_buf[len_offset..len_offset + 4].try_into().unwrap()) as usize;
            let total = header_len + len;
            if self.read_buf.len() < total {
                break;
            }
            let payload = self.read_buf[header_len..total].to_vec();
            self.read_buf.drain(0..total);
            frames.push((kind, tag, payload));
        }
        frames
    }
}

fn frame_unexpected(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(KIND_UNEXPECTED);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn frame_expected(tag: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(13 + payload.len());
    frame.push(KIND_EXPECTED);
    frame.extend_from_slice(&tag.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Default)]
pub struct TcpPlugin;

impl NaPlugin for TcpPlugin {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn check_protocol(&self, protocol: &str) -> bool {
        protocol == "tcp"
    }

    fn initialize(&self, info: &AddrInfo, listen: bool) -> NaResult<NaClassHandle> {
        let poll = Poll::new().map_err(|_| NaError::ProtocolError)?;

        let (listener, listen_addr) = if listen {
            let bind_to: SocketAddr = match &info.host_name {
                Some(host) => host.parse().map_err(|_| NaError::InvalidParam)?,
                None => "0.0.0.0:0".parse().unwrap(),
            };
            let mut listener = TcpListener::bind(bind_to).map_err(|_| NaError::ProtocolError)?;
            poll.registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                .map_err(|_| NaError::ProtocolError)?;
            let local = listener.local_addr().map_err(|_| NaError::ProtocolError)?;
            (Some(Mutex::new(listener)), Some(local))
        } else {
            (None, None)
        };

        debug!("na-tcp: initialized class, listen={} addr={:?}", listen, listen_addr);
        Ok(Arc::new(TcpClassOps {
            poll: Mutex::new(poll),
            listener,
            listen_addr,
            next_token: AtomicUsize::new(1),
            connections: Mutex::new(HashMap::new()),
            addr_to_token: Mutex::new(HashMap::new()),
            unexpected_backlog: Mutex::new(VecDeque::new()),
            unexpected_pending: Mutex::new(VecDeque::new()),
            expected_backlog: Mutex::new(HashMap::new()),
            expected_pending: Mutex::new(HashMap::new()),
        }))
    }
}

struct TcpMemHandle {
    data: Mutex<Vec<u8>>,
}

impl fmt::Debug for TcpMemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpMemHandle").field("len", &self.data.lock().unwrap().len()).finish()
    }
}

impl MemPayload for TcpMemHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct TcpClassOps {
    poll: Mutex<Poll>,
    listener: Option<Mutex<TcpListener>>,
    listen_addr: Option<SocketAddr>,
    next_token: AtomicUsize,
    connections: Mutex<HashMap<Token, ConnState>>,
    addr_to_token: Mutex<HashMap<SocketAddr, Token>>,
    unexpected_backlog: Mutex<VecDeque<(Vec<u8>, Addr)>>,
    unexpected_pending: Mutex<VecDeque<PendingUnexpected>>,
    expected_backlog: Mutex<HashMap<u64, Vec<u8>>>,
    expected_pending: Mutex<HashMap<u64, PendingExpected>>,
}

impl TcpClassOps {
    fn connect_or_get(&self, addr: SocketAddr) -> NaResult<Token> {
        if let Some(token) = self.addr_to_token.lock().unwrap().get(&addr) {
            return Ok(*token);
        }
        let std_stream = std::net::TcpStream::connect(addr).map_err(|_| NaError::ProtocolError)?;
        std_stream.set_nonblocking(true).map_err(|_| NaError::ProtocolError)?;
        let mut stream = TcpStream::from_std(std_stream);
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.poll
            .lock()
            .unwrap()
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(|_| NaError::ProtocolError)?;
        self.connections
            .lock()
            .unwrap()
            .insert(token, ConnState { stream, peer: addr, read_buf: Vec::new(), write_queue: VecDeque::new() });
        self.addr_to_token.lock().unwrap().insert(addr, token);
        Ok(token)
    }

    fn queue_and_flush(&self, token: Token, frame: Vec<u8>) -> NaResult<()> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections.get_mut(&token).ok_or(NaError::InvalidParam)?;
        conn.queue_frame(frame);
        let _ = conn.flush();
        Ok(())
    }

    fn accept_all(&self) {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return,
        };
        let listener = listener.lock().unwrap();
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
                    if self
                        .poll
                        .lock()
                        .unwrap()
                        .registry()
                        .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                        .is_err()
                    {
                        continue;
                    }
                    trace!("na-tcp: accepted connection from {peer}");
                    self.connections.lock().unwrap().insert(
                        token,
                        ConnState { stream, peer, read_buf: Vec::new(), write_queue: VecDeque::new() },
                    );
                    self.addr_to_token.lock().unwrap().insert(peer, token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("na-tcp: accept error: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch_frame(&self, kind: u8, tag: Option<u64>, payload: Vec<u8>, source: Addr) {
        match kind {
            KIND_UNEXPECTED => {
                let mut pending = self.unexpected_pending.lock().unwrap();
                if let Some(waiter) = pending.pop_front() {
                    drop(pending);
                    waiter.ctx.completion_add(CompletionRecord::new(move || {
                        (waiter.cb)(Ok(UnexpectedRecv { buf: payload, source }));
                        0
                    }));
                } else {
                    drop(pending);
                    self.unexpected_backlog.lock().unwrap().push_back((payload, source));
                }
            }
            KIND_EXPECTED => {
                let tag = tag.unwrap_or(0);
                let mut pending = self.expected_pending.lock().unwrap();
                if let Some(waiter) = pending.remove(&tag) {
                    drop(pending);
                    waiter.ctx.completion_add(CompletionRecord::new(move || {
                        (waiter.cb)(Ok(payload));
                        0
                    }));
                } else {
                    drop(pending);
                    self.expected_backlog.lock().unwrap().insert(tag, payload);
                }
            }
            _ => warn!("na-tcp: dropped frame with unknown kind {kind}"),
        }
    }
}

impl NaClassOps for TcpClassOps {
    fn finalize(&self) -> NaResult<()> {
        Ok(())
    }

    fn addr_lookup(
        &self,
        context: &Arc<Context>,
        name: &str,
        _op_id: OpId,
        on_complete: Box<dyn FnOnce(NaResult<Addr>) + Send>,
    ) -> NaResult<()> {
        let resolved = self.addr_lookup2(name);
        context.completion_add(CompletionRecord::new(move || {
            on_complete(resolved);
            0
        }));
        Ok(())
    }

    fn addr_lookup2(&self, name: &str) -> NaResult<Addr> {
        let socket_addr: SocketAddr = name.parse().map_err(|_| NaError::InvalidParam)?;
        Ok(make_addr(socket_addr))
    }

    fn addr_self(&self) -> NaResult<Addr> {
        self.listen_addr.map(make_addr).ok_or(NaError::ProtocolError)
    }

    fn addr_to_string(&self, addr: &Addr) -> NaResult<String> {
        Ok(peer_addr(addr)?.to_string())
    }

    fn addr_serialize(&self, addr: &Addr) -> NaResult<Vec<u8>> {
        Ok(peer_addr(addr)?.to_string().into_bytes())
    }

    fn addr_deserialize(&self, buf: &[u8]) -> NaResult<Addr> {
        let text = std::str::from_utf8(buf).map_err(|_| NaError::ProtocolError)?;
        self.addr_lookup2(text)
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
        let addr = peer_addr(dest)?;
        let token = self.connect_or_get(addr)?;
        self.queue_and_flush(token, frame_unexpected(&buf))?;
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
        let mut backlog = self.unexpected_backlog.lock().unwrap();
        if let Some((payload, source)) = backlog.pop_front() {
            drop(backlog);
            if payload.len() > buf.len() {
                context.completion_add(CompletionRecord::new(move || {
                    on_complete(Err(NaError::SizeError));
                    0
                }));
                return Ok(());
            }
            context.completion_add(CompletionRecord::new(move || {
                on_complete(Ok(UnexpectedRecv { buf: payload, source }));
                0
            }));
        } else {
            drop(backlog);
            self.unexpected_pending.lock().unwrap().push_back(PendingUnexpected {
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
        let addr = peer_addr(dest)?;
        let token = self.connect_or_get(addr)?;
        self.queue_and_flush(token, frame_expected(tag, &buf))?;
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
        let mut backlog = self.expected_backlog.lock().unwrap();
        if let Some(payload) = backlog.remove(&tag) {
            drop(backlog);
            context.completion_add(CompletionRecord::new(move || {
                on_complete(Ok(payload));
                0
            }));
        } else {
            drop(backlog);
            self.expected_pending
                .lock()
                .unwrap()
                .insert(tag, PendingExpected { op_id, cb: on_complete, ctx: Arc::clone(context) });
        }
        Ok(())
    }

    fn mem_handle_create(&self, buf: &[u8]) -> NaResult<MemHandle> {
        Ok(MemHandle(Arc::new(TcpMemHandle { data: Mutex::new(buf.to_vec()) })))
    }

    fn mem_handle_serialize(&self, handle: &MemHandle) -> NaResult<Vec<u8>> {
        let mem = handle.0.as_any().downcast_ref::<TcpMemHandle>().ok_or(NaError::InvalidParam)?;
        Ok(mem.data.lock().unwrap().clone())
    }

    fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<MemHandle> {
        Ok(MemHandle(Arc::new(TcpMemHandle { data: Mutex::new(buf.to_vec()) })))
    }

    fn cancel(&self, context: &Arc<Context>, op_id: OpId) -> NaResult<()> {
        {
            let mut pending = self.unexpected_pending.lock().unwrap();
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
            let mut pending = self.expected_pending.lock().unwrap();
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

    fn progress(&self, _context: &Arc<Context>, timeout_ms: u32) -> NaResult<()> {
        let mut events = Events::with_capacity(128);
        {
            let mut poll = self.poll.lock().unwrap();
            poll.poll(&mut events, Some(Duration::from_millis(timeout_ms as u64)))
                .map_err(|_| NaError::ProtocolError)?;
        }

        if events.is_empty() {
            return Err(NaError::Timeout);
        }

        let mut made_progress = false;
        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                self.accept_all();
                made_progress = true;
                continue;
            }

            let token = event.token();
            let mut frames = Vec::new();
            let mut closed = false;
            {
                let mut connections = self.connections.lock().unwrap();
                if let Some(conn) = connections.get_mut(&token) {
                    if event.is_writable() {
                        let _ = conn.flush();
                    }
                    if event.is_readable() {
                        match conn.read_available() {
                            Ok(true) => frames = conn.drain_frames(),
                            Ok(false) => closed = true,
                            Err(_) => closed = true,
                        }
                    }
                }
                if closed {
                    connections.remove(&token);
                }
            }

            if closed {
                self.addr_to_token.lock().unwrap().retain(|_, t| *t != token);
            }

            for (kind, tag, payload) in frames {
                let connections = self.connections.lock().unwrap();
                let source_addr = connections.get(&token).map(|c| c.peer);
                drop(connections);
                if let Some(peer) = source_addr {
                    self.dispatch_frame(kind, tag, payload, make_addr(peer));
                    made_progress = true;
                }
            }
        }

        if made_progress {
            Ok(())
        } else {
            Err(NaError::Timeout)
        }
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
    use std::time::Instant;

    fn registry() -> PluginRegistry {
        PluginRegistry::new().with_plugin(Arc::new(TcpPlugin))
    }

    fn drive_until<F: Fn() -> bool>(ctx: &Arc<Context>, deadline: Duration, done: F) {
        let start = Instant::now();
        while !done() && start.elapsed() < deadline {
            let _ = ctx.progress(20);
            ctx.trigger(0, 16);
        }
    }

    #[test]
    fn unexpected_round_trip_over_a_real_socket() {
        let registry = registry();
        let server = NaClass::initialize(&registry, "tcp://127.0.0.1:0", true, ProgressMode::NoBlock).unwrap();
        let client = NaClass::initialize(&registry, "tcp://", false, ProgressMode::NoBlock).unwrap();
        let server_ctx = server.context_create(None).unwrap();
        let client_ctx = client.context_create(None).unwrap();

        let server_addr = server.addr_self().unwrap();
        let server_addr_str = server.addr_to_string(&server_addr, None).unwrap();
        let dest_name = server_addr_str.trim_start_matches("tcp+");
        let dest = client.addr_lookup2(dest_name).unwrap();

        let received: Arc<StdMutex<Option<Vec<u8>>>> = Arc::new(StdMutex::new(None));
        let received2 = Arc::clone(&received);
        server
            .plugin()
            .msg_recv_unexpected(
                &server_ctx,
                server.msg_buf_alloc(64),
                server.op_create(),
                Box::new(move |result| *received2.lock().unwrap() = Some(result.unwrap().buf)),
            )
            .unwrap();

        client
            .plugin()
            .msg_send_unexpected(
                &client_ctx,
                &dest,
                b"hello over tcp".to_vec(),
                client.op_create(),
                Box::new(|result| result.unwrap()),
            )
            .unwrap();

        client_ctx.trigger(0, 1);
        drive_until(&server_ctx, Duration::from_secs(2), || received.lock().unwrap().is_some());

        assert_eq!(received.lock().unwrap().take().unwrap(), b"hello over tcp");
    }
}
