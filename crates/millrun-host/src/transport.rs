//! Transports: stdin and TCP feeding the channel manager, and the output
//! router fanning responses back out.
//!
//! Transport tasks are async; the machine runs on its own thread at a
//! steady tick. Input crosses over a crossbeam channel (transport tasks
//! never block on it), output crosses back over a tokio channel consumed by
//! the router task.

use crossbeam_channel::Sender;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::machine::OutLine;

/// Input events from transports to the machine thread.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(usize),
    Bytes(usize, Vec<u8>),
    Disconnected(usize),
}

/// Channel slot assignments. Slot 0 is stdin (always-both, like a UART);
/// TCP connections take the remaining slots.
pub const CHANNEL_STDIN: usize = 0;
pub const CHANNEL_TCP_BASE: usize = 1;
pub const TCP_SLOTS: usize = 2;

/// Read stdin line-by-line into channel 0.
pub fn spawn_stdin(tx: Sender<TransportEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if tx.send(TransportEvent::Bytes(CHANNEL_STDIN, bytes)).is_err() {
                break;
            }
        }
    });
}

/// Accept TCP connections, one channel slot each.
pub async fn run_tcp_listener(
    port: u16,
    tx: Sender<TransportEvent>,
    writers: std::sync::Arc<parking_lot::Mutex<TcpWriters>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for command connections");
    let mut next_slot = 0usize;

    loop {
        let (socket, peer) = listener.accept().await?;
        let channel = CHANNEL_TCP_BASE + (next_slot % TCP_SLOTS);
        next_slot += 1;
        info!(%peer, channel, "connection accepted");

        let (read_half, write_half) = socket.into_split();
        writers.lock().set(channel, write_half);

        let _ = tx.send(TransportEvent::Connected(channel));
        let tx = tx.clone();
        let writers = writers.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if tx.send(TransportEvent::Bytes(channel, bytes)).is_err() {
                    break;
                }
            }
            writers.lock().clear(channel);
            let _ = tx.send(TransportEvent::Disconnected(channel));
            info!(channel, "connection closed");
        });
    }
}

/// The write halves of live TCP connections, by channel.
#[derive(Default)]
pub struct TcpWriters {
    writers: Vec<Option<tokio::net::tcp::OwnedWriteHalf>>,
}

impl TcpWriters {
    fn set(&mut self, channel: usize, writer: tokio::net::tcp::OwnedWriteHalf) {
        if self.writers.len() <= channel {
            self.writers.resize_with(channel + 1, || None);
        }
        self.writers[channel] = Some(writer);
    }

    fn clear(&mut self, channel: usize) {
        if let Some(slot) = self.writers.get_mut(channel) {
            *slot = None;
        }
    }

    fn take(&mut self, channel: usize) -> Option<tokio::net::tcp::OwnedWriteHalf> {
        self.writers.get_mut(channel)?.take()
    }

    fn put_back(&mut self, channel: usize, writer: tokio::net::tcp::OwnedWriteHalf) {
        self.set(channel, writer);
    }
}

/// Fan machine output back to the transports. Broadcast lines go to stdout
/// and every live connection.
pub async fn run_output_router(
    mut rx: UnboundedReceiver<OutLine>,
    writers: std::sync::Arc<parking_lot::Mutex<TcpWriters>>,
) {
    while let Some(out) = rx.recv().await {
        let line = format!("{}\n", out.text);
        match out.channel {
            Some(CHANNEL_STDIN) | None => {
                print!("{line}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            _ => {}
        }
        let targets: Vec<usize> = match out.channel {
            Some(ch) if ch >= CHANNEL_TCP_BASE => vec![ch],
            Some(_) => vec![],
            None => (CHANNEL_TCP_BASE..CHANNEL_TCP_BASE + TCP_SLOTS).collect(),
        };
        for channel in targets {
            let writer = writers.lock().take(channel);
            if let Some(mut w) = writer {
                if w.write_all(line.as_bytes()).await.is_err() {
                    warn!(channel, "write failed; dropping connection writer");
                } else {
                    writers.lock().put_back(channel, w);
                }
            }
        }
    }
}
