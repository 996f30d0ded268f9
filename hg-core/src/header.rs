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

//! Request/response header layout (spec.md §4, supplemented from
//! `mercury_core.h`). Plugins own payload framing (Non-goal: no wire
//! protocol mandated beyond this), but the request/response header
//! itself is a fixed, versionless layout shared by every plugin.

/// `HG_CORE_MORE_DATA`: the input or output didn't fit the plugin's
/// eager size and a bulk transfer follows.
pub const FLAG_MORE_DATA: u8 = 0x01;
/// `HG_CORE_NO_RESPONSE`: caller does not want a response; the server
/// still runs the RPC callback but never calls `respond`.
pub const FLAG_NO_RESPONSE: u8 = 0x02;

/// Fixed-size request header prefixed to every eagerly-sent RPC
/// payload. Plugins reserve this many bytes ahead of the caller's input
/// when reporting their eager size (see `HgClass::input_eager_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub rpc_id: u64,
    pub flags: u8,
    pub target_context_id: u8,
    pub cookie: u64,
}

impl RequestHeader {
    pub const WIRE_SIZE: usize = 8 + 1 + 1 + 8;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.rpc_id.to_be_bytes());
        buf[8] = self.flags;
        buf[9] = self.target_context_id;
        buf[10..18].copy_from_slice(&self.cookie.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(RequestHeader {
            rpc_id: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            flags: buf[8],
            target_context_id: buf[9],
            cookie: u64::from_be_bytes(buf[10..18].try_into().ok()?),
        })
    }

    pub fn has_more_data(&self) -> bool {
        self.flags & FLAG_MORE_DATA != 0
    }

    pub fn wants_response(&self) -> bool {
        self.flags & FLAG_NO_RESPONSE == 0
    }
}

/// Fixed-size response header. Carries the request's `cookie` back so
/// the client can match the response to the in-flight handle, plus a
/// status so a server-side failure (`NoMatch`, a plugin error) surfaces
/// to the caller's forward callback without a second round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cookie: u64,
    pub flags: u8,
    pub status: i32,
}

impl ResponseHeader {
    pub const WIRE_SIZE: usize = 8 + 1 + 4;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.cookie.to_be_bytes());
        buf[8] = self.flags;
        buf[9..13].copy_from_slice(&self.status.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(ResponseHeader {
            cookie: u64::from_be_bytes(buf[0..8].try_into().ok()?),
            flags: buf[8],
            status: i32::from_be_bytes(buf[9..13].try_into().ok()?),
        })
    }

    pub fn has_more_data(&self) -> bool {
        self.flags & FLAG_MORE_DATA != 0
    }
}
