//! # millrun
//!
//! The motion controller host process: G-code and JSON in, step pulses and
//! reports out. With no step hardware attached it drives the virtual
//! machine at real-time rate, which makes it a faithful workbench for
//! hosts, senders and the motion core itself.
//!
//! ## Concurrency
//!
//! Transports run as tokio tasks; the machine runs on a dedicated thread
//! that emulates the interrupt priority ladder (DDA -> loader -> exec ->
//! forward plan -> dispatcher) at the configured DDA rate. The two sides
//! meet only at the byte channels.

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crossbeam_channel::TryRecvError;
use millrun_host::batch::{self, BatchArgs};
use millrun_host::config::MachineProfile;
use millrun_host::machine::Machine;
use millrun_host::transport::{self, TransportEvent, CHANNEL_STDIN, TCP_SLOTS};
use proto::ChannelPolicy;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// A multi-axis CNC motion controller host.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller on stdin plus a TCP command port.
    Run(RunArgs),
    /// Process a G-code file under a simulated clock and print the wire.
    Batch(BatchArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the machine profile.
    #[arg(short, long, default_value = "millrun.cfg")]
    config_path: PathBuf,

    /// TCP command port.
    #[arg(short, long, default_value_t = 2000)]
    port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_server(args),
        Commands::Batch(args) => batch::run_batch(args),
    }
}

fn run_server(args: RunArgs) -> Result<()> {
    info!("starting millrun controller");

    let profile = if args.config_path.exists() {
        info!(path = ?args.config_path, "loading machine profile");
        MachineProfile::load(&args.config_path)?
    } else {
        info!("no profile found; using defaults");
        MachineProfile::default()
    };

    let mut machine = Machine::new(profile);
    // channel 0: stdin behaves like a UART console (always both roles)
    let stdin_channel = machine.channels.add_channel(ChannelPolicy {
        always_both: true,
        mute_as_secondary: false,
    });
    assert_eq!(stdin_channel, CHANNEL_STDIN);
    for _ in 0..TCP_SLOTS {
        machine.channels.add_channel(ChannelPolicy::default());
    }

    let (in_tx, in_rx) = crossbeam_channel::unbounded::<TransportEvent>();
    let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
    let writers = std::sync::Arc::new(parking_lot::Mutex::new(Default::default()));

    // the machine thread: wall clock -> DDA ticks
    let machine_thread = std::thread::spawn(move || {
        let started = Instant::now();
        let mut ticks_done: u64 = 0;
        loop {
            loop {
                match in_rx.try_recv() {
                    Ok(TransportEvent::Bytes(channel, bytes)) => {
                        machine.channels.feed(channel, &bytes);
                    }
                    Ok(TransportEvent::Connected(channel)) => {
                        for notice in machine.channels.connect(channel) {
                            let text = machine.writer.muted(notice.muted);
                            machine.emit_unsuppressed(notice.channel, text);
                        }
                    }
                    Ok(TransportEvent::Disconnected(channel)) => {
                        for notice in machine.channels.disconnect(channel) {
                            let text = machine.writer.muted(notice.muted);
                            machine.emit_unsuppressed(notice.channel, text);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let elapsed = started.elapsed();
            let now_ms = elapsed.as_millis() as u32;
            let ticks_target = elapsed.as_micros() as u64 / 5; // 200 kHz
            // bound the catch-up burst so a stall doesn't freeze the loop
            let dda_ticks = (ticks_target - ticks_done).min(10_000) as u32;
            ticks_done += dda_ticks as u64;

            machine.tick(now_ms, dda_ticks);
            for out in machine.drain_output() {
                if out_tx.send(out).is_err() {
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_micros(500));
        }
    });

    // transports on the tokio side
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        transport::spawn_stdin(in_tx.clone());
        tokio::spawn(transport::run_output_router(out_rx, writers.clone()));
        let listener = transport::run_tcp_listener(args.port, in_tx.clone(), writers.clone());
        tokio::select! {
            result = listener => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    })?;

    drop(in_tx);
    let _ = machine_thread.join();
    Ok(())
}
