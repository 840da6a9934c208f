//! Batch mode: run a G-code file through the whole pipeline under a
//! simulated clock and print every wire record. Useful for profiling a
//! program's motion without hardware, and as the scriptable test surface.

use anyhow::{Context, Result};
use clap::Parser;
use proto::ChannelPolicy;
use std::path::PathBuf;
use tracing::info;

use crate::config::MachineProfile;
use crate::machine::Machine;

/// DDA ticks per simulated millisecond (200 kHz).
const TICKS_PER_MS: u32 = 200;

/// Arguments for the `batch` subcommand.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// G-code file to process.
    pub input: PathBuf,

    /// Path to the machine profile.
    #[arg(short, long, default_value = "millrun.cfg")]
    pub config_path: PathBuf,

    /// Stop after this many simulated seconds.
    #[arg(long, default_value_t = 600)]
    pub time_limit_s: u32,
}

pub fn run_batch(args: BatchArgs) -> Result<()> {
    let profile = if args.config_path.exists() {
        MachineProfile::load(&args.config_path)?
    } else {
        MachineProfile::default()
    };
    let mut machine = Machine::new(profile);
    let channel = machine.channels.add_channel(ChannelPolicy {
        always_both: true,
        mute_as_secondary: false,
    });

    let program = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {:?}", args.input))?;
    let mut lines = program.lines();
    let mut now_ms: u32 = 0;
    let mut pending: Option<Vec<u8>> = None;
    let mut eof = false;

    while now_ms < args.time_limit_s * 1000 {
        // feed the next line whenever the channel has room
        if pending.is_none() && !eof {
            match lines.next() {
                Some(line) => {
                    let mut bytes = line.as_bytes().to_vec();
                    bytes.push(b'\n');
                    pending = Some(bytes);
                }
                None => eof = true,
            }
        }
        if let Some(bytes) = pending.take() {
            let fed = machine.channels.feed(channel, &bytes);
            if fed < bytes.len() {
                pending = Some(bytes[fed..].to_vec());
            }
        }

        now_ms += 1;
        machine.tick(now_ms, TICKS_PER_MS);
        for out in machine.drain_output() {
            println!("{}", out.text);
        }

        if eof
            && pending.is_none()
            && !machine.planner.queue.has_runnable()
            && !machine.stepper.runtime_is_busy()
            && !machine.arc.is_active()
            && !machine.signals.in_cycle
        {
            break;
        }
    }

    info!(
        simulated_ms = now_ms,
        x = machine.runtime.position[0],
        y = machine.runtime.position[1],
        z = machine.runtime.position[2],
        "batch complete"
    );
    Ok(())
}
