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

//! End-to-end RPC round trip over the `na-sm` loopback plugin: a server
//! registers an echo handler, a client forwards a payload to it and
//! gets the same bytes back in the response.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hg_core::{HgClass, HgContext, HgHandle};
use na_core::{PluginRegistry, ProgressMode};
use na_sm::SmPlugin;

const ECHO_RPC_ID: u64 = 0x1234;

fn registry() -> PluginRegistry {
    PluginRegistry::new().with_plugin(Arc::new(SmPlugin))
}

fn drive_until(contexts: &[&Arc<HgContext>], deadline: Duration, done: impl Fn() -> bool) {
    let start = Instant::now();
    while !done() && start.elapsed() < deadline {
        for ctx in contexts {
            let _ = ctx.progress(5);
            ctx.trigger(5, 32);
        }
    }
}

#[test]
fn echo_round_trip_over_sm() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://echo-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    server_class.register(
        ECHO_RPC_ID,
        Arc::new(|handle: Arc<HgHandle>| {
            let input = handle.input();
            handle.set_output(input).unwrap();
            let ctx = handle.owner().expect("a server-received handle always has an owner");
            ctx.respond(&handle, Box::new(|result| result.expect("respond should succeed"))).unwrap();
        }),
    );

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(4, true).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();

    let dest = client_class.na().addr_lookup2("echo-hg").unwrap();

    let handle = client_ctx.create();
    let payload: Vec<u8> = (0..8).collect();
    handle.set_target(dest, ECHO_RPC_ID, 0, false);
    handle.set_input(payload.clone()).unwrap();

    let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client_ctx
        .forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)))
        .unwrap();

    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || outcome.lock().unwrap().is_some());

    outcome.lock().unwrap().take().expect("forward completed within the deadline").expect("echo rpc should succeed");
    assert_eq!(handle.output(), payload);
}

#[test]
fn forward_to_unregistered_rpc_id_reports_no_match() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://no-match-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(4, true).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();

    let dest = client_class.na().addr_lookup2("no-match-hg").unwrap();

    let handle = client_ctx.create();
    handle.set_target(dest, 0xdead, 0, false);
    handle.set_input(vec![1, 2, 3]).unwrap();

    let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client_ctx
        .forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)))
        .unwrap();

    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || outcome.lock().unwrap().is_some());

    let result = outcome.lock().unwrap().take().expect("forward completed within the deadline");
    assert_eq!(result.unwrap_err(), hg_core::HgError::NoMatch);
}

#[test]
fn no_response_forward_completes_without_a_reply() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://fire-and-forget-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen2 = Arc::clone(&seen);
    server_class.register(
        ECHO_RPC_ID,
        Arc::new(move |handle: Arc<HgHandle>| {
            *seen2.lock().unwrap() = Some(handle.input());
        }),
    );

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(4, true).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();

    let dest = client_class.na().addr_lookup2("fire-and-forget-hg").unwrap();

    let handle = client_ctx.create();
    handle.set_target(dest, ECHO_RPC_ID, 0, true);
    handle.set_input(vec![9, 9, 9]).unwrap();

    let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client_ctx
        .forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)))
        .unwrap();

    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some() && seen.lock().unwrap().is_some()
    });

    outcome.lock().unwrap().take().expect("forward completed within the deadline").expect("no_response forward never fails locally");
    assert_eq!(seen.lock().unwrap().take().unwrap(), vec![9, 9, 9]);
}

#[test]
fn more_data_request_routes_through_acquire_before_dispatch_and_releases_on_drop() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://more-data-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    let acquired = Arc::new(Mutex::new(false));
    let released = Arc::new(Mutex::new(false));
    let dispatched_after_acquire = Arc::new(Mutex::new(false));

    let acquired2 = Arc::clone(&acquired);
    let released2 = Arc::clone(&released);
    server_class.set_more_data_callback(
        move |_handle, done| {
            *acquired2.lock().unwrap() = true;
            done(Ok(()));
        },
        move |_handle| {
            *released2.lock().unwrap() = true;
        },
    );

    let acquired3 = Arc::clone(&acquired);
    let dispatched_after_acquire2 = Arc::clone(&dispatched_after_acquire);
    server_class.register(
        ECHO_RPC_ID,
        Arc::new(move |handle: Arc<HgHandle>| {
            *dispatched_after_acquire2.lock().unwrap() = *acquired3.lock().unwrap();
            let input = handle.input();
            handle.set_output(input).unwrap();
            let ctx = handle.owner().expect("a server-received handle always has an owner");
            ctx.respond(&handle, Box::new(|result| result.expect("respond should succeed"))).unwrap();
        }),
    );

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(4, true).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();

    let dest = client_class.na().addr_lookup2("more-data-hg").unwrap();

    let handle = client_ctx.create();
    let payload = vec![7u8; 4];
    handle.set_target(dest, ECHO_RPC_ID, 0, false);
    handle.set_input(payload.clone()).unwrap();
    handle.set_more_data(true).unwrap();

    let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client_ctx
        .forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)))
        .unwrap();

    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some() && *released.lock().unwrap()
    });

    outcome.lock().unwrap().take().expect("forward completed within the deadline").expect("echo rpc should succeed");
    assert!(*acquired.lock().unwrap(), "more_data acquire hook must run for a MoreData request");
    assert!(*dispatched_after_acquire.lock().unwrap(), "rpc callback must not run before acquire completes");
    assert!(*released.lock().unwrap(), "release hook must run once the server handle is dropped");
}

#[test]
fn more_data_request_is_rejected_when_no_hook_is_registered() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://more-data-no-hook-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    server_class.register(
        ECHO_RPC_ID,
        Arc::new(|_handle: Arc<HgHandle>| {
            panic!("rpc callback must not run when no more_data hook can acquire the payload");
        }),
    );

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(4, true).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();

    let dest = client_class.na().addr_lookup2("more-data-no-hook-hg").unwrap();

    let handle = client_ctx.create();
    handle.set_target(dest, ECHO_RPC_ID, 0, false);
    handle.set_input(vec![1, 2, 3]).unwrap();
    handle.set_more_data(true).unwrap();

    let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
    let outcome2 = Arc::clone(&outcome);
    client_ctx
        .forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)))
        .unwrap();

    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || outcome.lock().unwrap().is_some());

    let result = outcome.lock().unwrap().take().expect("forward completed within the deadline");
    assert_eq!(result.unwrap_err(), hg_core::HgError::Na(na_core::NaError::ProtocolError));
}

#[test]
fn context_post_one_shot_batch_does_not_repost_once_exhausted() {
    let registry = registry();
    let server_class = HgClass::init(&registry, "sm://one-shot-hg", true, ProgressMode::NoBlock).unwrap();
    let client_class = HgClass::init(&registry, "sm://", false, ProgressMode::NoBlock).unwrap();

    server_class.register(
        ECHO_RPC_ID,
        Arc::new(|handle: Arc<HgHandle>| {
            let input = handle.input();
            handle.set_output(input).unwrap();
            let ctx = handle.owner().expect("a server-received handle always has an owner");
            ctx.respond(&handle, Box::new(|result| result.expect("respond should succeed"))).unwrap();
        }),
    );

    let server_ctx = HgContext::create(&server_class, None).unwrap();
    server_ctx.context_post(2, false).unwrap();
    let client_ctx = HgContext::create(&client_class, None).unwrap();
    let dest = client_class.na().addr_lookup2("one-shot-hg").unwrap();

    let send_one = |payload: Vec<u8>| {
        let handle = client_ctx.create();
        handle.set_target(dest.clone(), ECHO_RPC_ID, 0, false);
        handle.set_input(payload).unwrap();
        let outcome: Arc<Mutex<Option<hg_core::HgResult<()>>>> = Arc::new(Mutex::new(None));
        let outcome2 = Arc::clone(&outcome);
        client_ctx.forward(&handle, Box::new(move |result| *outcome2.lock().unwrap() = Some(result))).unwrap();
        (handle, outcome)
    };

    let (h1, o1) = send_one(vec![1]);
    let (h2, o2) = send_one(vec![2]);
    drive_until(&[&server_ctx, &client_ctx], Duration::from_secs(2), || {
        o1.lock().unwrap().is_some() && o2.lock().unwrap().is_some()
    });
    o1.lock().unwrap().take().expect("forward completed within the deadline").expect("echo rpc should succeed");
    o2.lock().unwrap().take().expect("forward completed within the deadline").expect("echo rpc should succeed");
    assert_eq!(h1.output(), vec![1]);
    assert_eq!(h2.output(), vec![2]);

    let (_h3, o3) = send_one(vec![3]);
    drive_until(&[&server_ctx, &client_ctx], Duration::from_millis(300), || o3.lock().unwrap().is_some());
    assert!(o3.lock().unwrap().is_none(), "no unexpected-recv slot should remain after the one-shot batch is exhausted");
}
