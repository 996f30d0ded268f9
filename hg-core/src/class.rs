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

//! HG-Core class: the RPC registration table and eager-size accounting
//! layered on top of an NA class (spec.md §4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use na_core::{NaClass, PluginRegistry, ProgressMode, UserData};

use crate::error::HgResult;
use crate::handle::HgHandle;
use crate::header::{RequestHeader, ResponseHeader};
use crate::registry::{RpcCallback, RpcRegistry};

/// `HG_Core_class_set_more_data_callback`'s acquire side: given the
/// just-received handle and a done-continuation, kicks off the
/// out-of-band bulk transfer and calls the continuation once it
/// finishes (or fails).
pub type MoreDataAcquireCb = dyn Fn(Arc<HgHandle>, Box<dyn FnOnce(HgResult<()>) + Send>) + Send + Sync;
/// The matching release side, run when a handle that went through
/// `acquire` is destroyed.
pub type MoreDataReleaseCb = dyn Fn(&HgHandle) + Send + Sync;

pub struct HgClass {
    pub(crate) na_class: NaClass,
    pub(crate) registry: RpcRegistry,
    pub(crate) next_cookie: AtomicU64,
    user_data: Mutex<Option<UserData>>,
    more_data_hooks: Mutex<Option<(Arc<MoreDataAcquireCb>, Arc<MoreDataReleaseCb>)>>,
}

impl HgClass {
    /// `HG_Core_init_opt`: initializes the underlying NA class and an
    /// empty RPC registration table.
    pub fn init(
        na_registry: &PluginRegistry,
        info_string: &str,
        listen: bool,
        mode: ProgressMode,
    ) -> HgResult<Arc<Self>> {
        let na_class = NaClass::initialize(na_registry, info_string, listen, mode)?;
        info!("HG-Core class initialized over NA protocol {}", na_class.protocol());
        Ok(Arc::new(HgClass {
            na_class,
            registry: RpcRegistry::new(),
            next_cookie: AtomicU64::new(1),
            user_data: Mutex::new(None),
            more_data_hooks: Mutex::new(None),
        }))
    }

    pub fn na(&self) -> &NaClass {
        &self.na_class
    }

    pub fn listening(&self) -> bool {
        self.na_class.listening()
    }

    pub fn set_user_data(&self, data: UserData) {
        *self.user_data.lock().unwrap() = Some(data);
    }

    pub fn register(&self, rpc_id: u64, callback: RpcCallback) {
        self.registry.register(rpc_id, callback);
    }

    pub fn deregister(&self, rpc_id: u64) {
        self.registry.deregister(rpc_id);
    }

    pub fn registered(&self, rpc_id: u64) -> bool {
        self.registry.registered(rpc_id)
    }

    pub fn register_data(&self, rpc_id: u64, data: UserData) {
        self.registry.register_data(rpc_id, data);
    }

    pub fn registered_data<R>(&self, rpc_id: u64, f: impl FnOnce(Option<&UserData>) -> R) -> Option<R> {
        self.registry.registered_data(rpc_id, f)
    }

    /// `HG_Core_class_get_input_eager_size`: the largest RPC input that
    /// fits a single unexpected send without a bulk transfer.
    pub fn input_eager_size(&self) -> usize {
        let reserved = RequestHeader::WIRE_SIZE + self.na_class.unexpected_header_size();
        self.na_class.unexpected_size_max().saturating_sub(reserved)
    }

    /// `HG_Core_class_get_output_eager_size`, symmetric on the expected
    /// channel.
    pub fn output_eager_size(&self) -> usize {
        let reserved = ResponseHeader::WIRE_SIZE + self.na_class.expected_header_size();
        self.na_class.expected_size_max().saturating_sub(reserved)
    }

    pub(crate) fn alloc_cookie(&self) -> u64 {
        self.next_cookie.fetch_add(1, Ordering::Relaxed)
    }

    /// `HG_Core_class_set_more_data_callback`: registers the class-wide
    /// acquire/release upcall pair used for requests whose payload set
    /// `FLAG_MORE_DATA` (spec.md §4.4). Replaces any previously
    /// registered pair.
    pub fn set_more_data_callback<A, R>(&self, acquire: A, release: R)
    where
        A: Fn(Arc<HgHandle>, Box<dyn FnOnce(HgResult<()>) + Send>) + Send + Sync + 'static,
        R: Fn(&HgHandle) + Send + Sync + 'static,
    {
        *self.more_data_hooks.lock().unwrap() = Some((Arc::new(acquire), Arc::new(release)));
    }

    pub(crate) fn more_data_acquire_hook(&self) -> Option<Arc<MoreDataAcquireCb>> {
        self.more_data_hooks.lock().unwrap().as_ref().map(|(acquire, _)| Arc::clone(acquire))
    }

    pub(crate) fn more_data_release_hook(&self) -> Option<Arc<MoreDataReleaseCb>> {
        self.more_data_hooks.lock().unwrap().as_ref().map(|(_, release)| Arc::clone(release))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_sm::SmPlugin;

    fn registry() -> PluginRegistry {
        PluginRegistry::new().with_plugin(Arc::new(SmPlugin))
    }

    #[test]
    fn eager_sizes_reserve_room_for_the_header() {
        let class = HgClass::init(&registry(), "sm://class-eager-size", true, ProgressMode::NoBlock).unwrap();
        assert!(class.input_eager_size() < class.na().unexpected_size_max());
        assert!(class.output_eager_size() < class.na().expected_size_max());
    }

    #[test]
    fn alloc_cookie_hands_out_distinct_increasing_values() {
        let class = HgClass::init(&registry(), "sm://class-cookies", true, ProgressMode::NoBlock).unwrap();
        let a = class.alloc_cookie();
        let b = class.alloc_cookie();
        assert!(b > a);
    }

    #[test]
    fn register_deregister_round_trips() {
        let class = HgClass::init(&registry(), "sm://class-registry", true, ProgressMode::NoBlock).unwrap();
        assert!(!class.registered(1));
        class.register(1, Arc::new(|_handle| {}));
        assert!(class.registered(1));
        class.deregister(1);
        assert!(!class.registered(1));
    }
}
