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

/// The flat status/error space of the NA layer.
///
/// Mirrors the original `na_return_t` enumeration: a single fieldless
/// enum used both as the `Err` side of fallible calls and as the status
/// carried by a completion record (where `Success` and `Canceled` are
/// legitimate values, not just error paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NaError {
    #[error("success")]
    Success,
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("buffer too small for requested data")]
    SizeError,
    #[error("alignment error")]
    AlignmentError,
    #[error("permission denied")]
    PermissionError,
    #[error("out of memory")]
    NoMemory,
    #[error("protocol error")]
    ProtocolError,
    #[error("address already in use")]
    AddressInUse,
    #[error("no matching handler")]
    NoMatch,
    #[error("operation would block, try again")]
    Again,
    #[error("completion queue overflow")]
    Overflow,
}

impl NaError {
    /// True for the two statuses that are not really failures.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, NaError::Success)
    }
}

pub type NaResult<T> = Result<T, NaError>;
