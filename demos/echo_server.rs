//! Demo (§10.7): a TCP echo service wiring `RuntimeConfig`, `RuntimeLogger`
//! and `Dispatch` together end to end. Illustrative, not part of the
//! library's public contract.

use std::any::Any;
use std::net::TcpListener;
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use mainmemory::config::RuntimeConfig;
use mainmemory::context::Context;
use mainmemory::dispatch::Dispatch;
use mainmemory::logger::RuntimeLogger;
use mainmemory::socket::BufferedStream;

#[derive(Parser, Debug)]
#[command(about = "Echo server built on the mainmemory runtime")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7070")]
    addr: String,

    /// Optional TOML config file overriding the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    RuntimeLogger::new().install().expect("install logger once");

    let config = match &args.config {
        Some(path) => RuntimeConfig::from_toml_file(path).expect("load config"),
        None => RuntimeConfig::default(),
    };
    log::set_max_level(config.level_filter());

    let mut dispatch = Dispatch::new(config).expect("prepare dispatch");
    dispatch.spawn_all().expect("spawn contexts");

    let listener = TcpListener::bind(&args.addr).expect("bind listener");
    listener.set_nonblocking(true).expect("nonblocking listener");
    info!(target: "mainmemory::demo", "echo server listening on {}", args.addr);

    let placed = dispatch.place_sink();
    dispatch.async_call(
        placed,
        Box::new(move |ctx: &mut Context| {
            spawn_acceptor_fiber(ctx, listener);
        }),
    );

    // A real service would wait on a signal; the demo just runs until
    // killed, so `dispatch` (and its threads) live for the process
    // lifetime.
    std::thread::park();
}

/// A fiber that accepts connections in a loop, yielding between attempts
/// instead of blocking the context's own loop (the listener isn't
/// registered as an event sink here for simplicity — a production
/// service would register it and wait on `fiber_block`/`submit_input`
/// instead of busy-yielding).
fn spawn_acceptor_fiber(ctx: &mut Context, listener: TcpListener) {
    let result = ctx.fiber_create(
        24,
        Box::new(move |ctx| {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!(target: "mainmemory::demo", "accepted {peer}");
                        spawn_echo_fiber(ctx, stream);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        ctx.fiber_yield();
                    }
                    Err(err) => {
                        warn!(target: "mainmemory::demo", "accept failed: {err}");
                        break;
                    }
                }
            }
            Box::new(()) as Box<dyn Any + Send>
        }),
    );
    if let Err(err) = result {
        warn!(target: "mainmemory::demo", "acceptor fiber_create failed: {err}");
    }
}

fn spawn_echo_fiber(ctx: &mut Context, stream: std::net::TcpStream) {
    let result = ctx.fiber_create(
        16,
        Box::new(move |ctx| {
            let mut conn = match BufferedStream::register(ctx, stream) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(target: "mainmemory::demo", "register failed: {err}");
                    return Box::new(()) as Box<dyn Any + Send>;
                }
            };
            loop {
                match conn.read_some(ctx, 4096) {
                    Ok(data) if data.is_empty() => {
                        ctx.fiber_yield();
                    }
                    Ok(data) => {
                        if conn.write_some(ctx, &data).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            conn.close(ctx);
            Box::new(()) as Box<dyn Any + Send>
        }),
    );
    if let Err(err) = result {
        warn!(target: "mainmemory::demo", "fiber_create failed: {err}");
    }
}
