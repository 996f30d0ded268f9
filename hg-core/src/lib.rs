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

//! HG-Core: the RPC handle state machine, registration table, and
//! request/response framing layered on top of an NA transport. See
//! `SPEC_FULL.md` at the workspace root for the full requirements this
//! crate implements.

pub mod class;
pub mod context;
pub mod error;
pub mod handle;
pub mod header;
pub mod registry;

pub use class::HgClass;
pub use context::HgContext;
pub use error::{HgError, HgResult};
pub use handle::{HandleState, HgHandle};
pub use header::{RequestHeader, ResponseHeader, FLAG_MORE_DATA, FLAG_NO_RESPONSE};
pub use registry::{RpcCallback, RpcRegistry};
