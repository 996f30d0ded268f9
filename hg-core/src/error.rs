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

use thiserror::Error;

use na_core::NaError;

/// The HG-Core status/error space (spec.md §7). A thin superset of
/// [`NaError`]: every NA failure the transport can report propagates
/// through unchanged via `#[from]`, plus the handful of conditions that
/// only make sense at the RPC layer (an unregistered `rpc_id`, a handle
/// reset/destroy ordering violation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HgError {
    #[error("success")]
    Success,
    #[error(transparent)]
    Na(#[from] NaError),
    #[error("no RPC registered for this id")]
    NoMatch,
    #[error("handle is not in a state that permits this operation")]
    InvalidHandleState,
    #[error("handle still has references outstanding")]
    Busy,
}

impl HgError {
    /// Encodes this error into the response header's `status` field.
    /// `0` is reserved for success and is never produced here.
    pub fn to_status(self) -> i32 {
        match self {
            HgError::Success => 0,
            HgError::Na(NaError::Canceled) => -1,
            HgError::Na(NaError::Timeout) => -2,
            HgError::Na(NaError::InvalidParam) => -3,
            HgError::Na(NaError::SizeError) => -4,
            HgError::Na(NaError::AlignmentError) => -5,
            HgError::Na(NaError::PermissionError) => -6,
            HgError::Na(NaError::NoMemory) => -7,
            HgError::Na(NaError::ProtocolError) => -8,
            HgError::Na(NaError::AddressInUse) => -9,
            HgError::Na(NaError::NoMatch) => -10,
            HgError::Na(NaError::Again) => -11,
            HgError::Na(NaError::Overflow) => -12,
            HgError::Na(NaError::Success) => 0,
            HgError::NoMatch => -20,
            HgError::InvalidHandleState => -21,
            HgError::Busy => -22,
        }
    }

    /// Decodes a response header `status` field back into an `HgError`,
    /// for the client side of a round trip that failed on the server.
    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            0 => None,
            -1 => Some(HgError::Na(NaError::Canceled)),
            -2 => Some(HgError::Na(NaError::Timeout)),
            -3 => Some(HgError::Na(NaError::InvalidParam)),
            -4 => Some(HgError::Na(NaError::SizeError)),
            -5 => Some(HgError::Na(NaError::AlignmentError)),
            -6 => Some(HgError::Na(NaError::PermissionError)),
            -7 => Some(HgError::Na(NaError::NoMemory)),
            -8 => Some(HgError::Na(NaError::ProtocolError)),
            -9 => Some(HgError::Na(NaError::AddressInUse)),
            -10 => Some(HgError::Na(NaError::NoMatch)),
            -11 => Some(HgError::Na(NaError::Again)),
            -12 => Some(HgError::Na(NaError::Overflow)),
            -20 => Some(HgError::NoMatch),
            -21 => Some(HgError::InvalidHandleState),
            -22 => Some(HgError::Busy),
            _ => Some(HgError::Na(NaError::ProtocolError)),
        }
    }
}

pub type HgResult<T> = Result<T, HgError>;
