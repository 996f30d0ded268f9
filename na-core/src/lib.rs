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

//! Network Abstraction (NA) transport layer.
//!
//! A pluggable, polling-driven engine that owns a completion queue,
//! coordinates multi-thread progress on a single context, and
//! dispatches completed operations to user callbacks. See `SPEC_FULL.md`
//! at the workspace root for the full requirements this crate implements.

pub mod class;
pub mod context;
pub mod error;
pub mod info;
pub mod plugin;
pub mod registry;
pub mod user_data;

pub use class::NaClass;
pub use context::{CompletionRecord, Context, ProgressMode, TriggerOutcome, COMPLETION_QUEUE_CAPACITY};
pub use error::{NaError, NaResult};
pub use info::AddrInfo;
pub use plugin::{Addr, AddrPayload, MemHandle, MemPayload, NaClassHandle, NaClassOps, NaPlugin, OpId, OpIdAllocator, UnexpectedRecv};
pub use registry::PluginRegistry;
pub use user_data::UserData;
