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

//! The process-wide, immutable-after-init plugin descriptor table and
//! the selection rule described in spec.md §4.1.

use std::sync::Arc;

use crate::error::{NaError, NaResult};
use crate::info::AddrInfo;
use crate::plugin::NaPlugin;

/// An ordered, immutable list of plugin descriptors.
///
/// Order matters: callers that want the "shared-memory-first" selection
/// contract push their `sm`-flavoured plugin before others.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn NaPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry { plugins: Vec::new() }
    }

    /// Appends a plugin descriptor. Built with a builder-style chain so
    /// callers can express ordering (sm first, etc.) at the call site.
    pub fn with_plugin(mut self, plugin: Arc<dyn NaPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Selects a plugin for the given address info.
    ///
    /// If `class_name` is set, the plugin whose name matches wins. Else
    /// the first plugin whose `check_protocol` accepts `protocol_name`
    /// wins. No match is `ProtocolError`.
    pub fn select(&self, info: &AddrInfo) -> NaResult<Arc<dyn NaPlugin>> {
        if let Some(class_name) = &info.class_name {
            return self
                .plugins
                .iter()
                .find(|p| p.name() == class_name)
                .cloned()
                .ok_or(NaError::ProtocolError);
        }

        self.plugins
            .iter()
            .find(|p| p.check_protocol(&info.protocol_name))
            .cloned()
            .ok_or(NaError::ProtocolError)
    }

    /// Best-effort process-wide cleanup: invokes every plugin's static
    /// cleanup hook, continuing even if individual hooks fail.
    pub fn cleanup_all(&self) {
        for plugin in &self.plugins {
            plugin.cleanup();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn NaPlugin>> {
        self.plugins.iter()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
