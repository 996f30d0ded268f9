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

//! Demo CLI: stands up a server and a client over either the `sm` or
//! `tcp` plugin and runs the echo RPC round trip from spec.md §8
//! scenario A -- a single process exercising the whole stack end to
//! end, analogous to Mercury's `Testing/test_rpc.c`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::info;

use hg_core::{HgClass, HgContext, HgHandle, HgResult};
use na_core::{PluginRegistry, ProgressMode};
use na_sm::SmPlugin;
use na_tcp::TcpPlugin;

const ECHO_RPC_ID: u64 = 0x1234;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Transport {
    Sm,
    Tcp,
}

#[derive(Parser, Debug)]
#[command(about = "Runs the echo RPC round trip over an in-process NA transport")]
struct Args {
    /// Which NA plugin to drive the round trip over.
    #[arg(long, value_enum, default_value_t = Transport::Sm)]
    transport: Transport,

    /// Address the server binds to, only consulted for --transport tcp.
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Process-wide endpoint name, only consulted for --transport sm.
    #[arg(long, default_value = "hg-echo-demo")]
    name: String,

    /// Number of bytes in the echoed payload.
    #[arg(long, default_value_t = 8)]
    payload_size: usize,

    /// Number of request/response round trips to run.
    #[arg(long, default_value_t = 1)]
    iterations: u32,
}

fn registry() -> PluginRegistry {
    PluginRegistry::new().with_plugin(Arc::new(SmPlugin)).with_plugin(Arc::new(TcpPlugin))
}

fn drive_loop(ctx: Arc<HgContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        let _ = ctx.progress(20);
        ctx.trigger(20, 32);
    }
}

fn run_one(client_ctx: &Arc<HgContext>, dest: na_core::Addr, payload: Vec<u8>) -> HgResult<Vec<u8>> {
    let handle = client_ctx.create();
    handle.set_target(dest, ECHO_RPC_ID, 0, false);
    handle.set_input(payload).unwrap();

    let result: Arc<Mutex<Option<HgResult<()>>>> = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    client_ctx.forward(&handle, Box::new(move |r| *result2.lock().unwrap() = Some(r)))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if result.lock().unwrap().is_some() {
            break;
        }
        if Instant::now() > deadline {
            return Err(na_core::NaError::Timeout.into());
        }
        let _ = client_ctx.progress(5);
        client_ctx.trigger(5, 32);
    }
    result.lock().unwrap().take().unwrap()?;
    Ok(handle.output())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let registry = registry();
    let (server_info, client_info, lookup_name) = match args.transport {
        Transport::Sm => (format!("sm://{}", args.name), "sm://".to_string(), args.name.clone()),
        Transport::Tcp => (format!("tcp://{}", args.bind), "tcp://".to_string(), String::new()),
    };

    let server_class = HgClass::init(&registry, &server_info, true, ProgressMode::NoBlock).expect("server class init failed");
    server_class.register(
        ECHO_RPC_ID,
        Arc::new(|handle: Arc<HgHandle>| {
            let input = handle.input();
            handle.set_output(input).expect("handle freshly dispatched handles are always Created");
            let ctx = handle.owner().expect("server-received handles always carry their owning context");
            ctx.respond(&handle, Box::new(|r| r.expect("respond should succeed in this demo"))).expect("respond failed");
        }),
    );
    let server_ctx = HgContext::create(&server_class, None).expect("server context create failed");
    server_ctx.context_post(4, true).expect("posting unexpected recv slots failed");

    let running = Arc::new(AtomicBool::new(true));
    let server_thread = {
        let ctx = Arc::clone(&server_ctx);
        let running = Arc::clone(&running);
        std::thread::spawn(move || drive_loop(ctx, running))
    };

    let client_class = HgClass::init(&registry, &client_info, false, ProgressMode::NoBlock).expect("client class init failed");
    let client_ctx = HgContext::create(&client_class, None).expect("client context create failed");

    // Resolved fresh per iteration: `forward` consumes its target `Addr`,
    // and for tcp a serialize/deserialize round trip stands in for an
    // out-of-band exchange of the server's bound address.
    let resolve_dest = || -> na_core::Addr {
        match args.transport {
            Transport::Sm => client_class.na().addr_lookup2(&lookup_name).expect("failed to resolve server address"),
            Transport::Tcp => {
                let server_addr = server_class.na().addr_self().expect("server has no bound address");
                let bytes = server_class.na().addr_serialize(&server_addr).expect("failed to serialize server address");
                client_class.na().addr_deserialize(&bytes).expect("failed to deserialize server address")
            }
        }
    };

    info!("hg-test: running {} iterations of a {}-byte echo over {:?}", args.iterations, args.payload_size, args.transport);
    for i in 0..args.iterations {
        let payload: Vec<u8> = (0..args.payload_size).map(|b| (b as u8).wrapping_add(i as u8)).collect();
        let start = Instant::now();
        match run_one(&client_ctx, resolve_dest(), payload.clone()) {
            Ok(output) if output == payload => {
                println!("iteration {i}: ok ({:?})", start.elapsed());
            }
            Ok(_) => {
                println!("iteration {i}: payload mismatch");
            }
            Err(e) => {
                println!("iteration {i}: failed: {e}");
            }
        }
    }

    running.store(false, Ordering::Release);
    server_thread.join().expect("server thread panicked");
}
