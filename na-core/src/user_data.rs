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

//! A small typed-erasure cell used for the "attached user data with a
//! free hook" pattern that recurs across the data model (§3): classes,
//! contexts, addresses and RPC registrations all have one.

use std::any::Any;

pub struct UserData {
    value: Option<Box<dyn Any + Send>>,
    free_hook: Option<Box<dyn FnOnce(Box<dyn Any + Send>) + Send>>,
}

impl UserData {
    pub fn new<T: Any + Send>(value: T) -> Self {
        UserData { value: Some(Box::new(value)), free_hook: None }
    }

    pub fn with_free_hook<T, F>(value: T, free_hook: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(Box<dyn Any + Send>) + Send + 'static,
    {
        UserData { value: Some(Box::new(value)), free_hook: Some(Box::new(free_hook)) }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref())
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let (Some(value), Some(hook)) = (self.value.take(), self.free_hook.take()) {
            hook(value);
        }
    }
}
