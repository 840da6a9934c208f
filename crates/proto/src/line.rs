//! Line extraction and channel policy.
//!
//! Each channel owns a byte ring filled by its transport. An incremental,
//! restartable scanner walks the ring classifying input into three things:
//! single-character controls (returned immediately, no terminator needed),
//! control lines (JSON, starting with `{`), and data lines (G-code).
//!
//! Over-long lines are discarded whole: a skip record marks the span so the
//! reader never sees a truncated prefix of a G-code block. The skip ring is
//! small; when it fills, scanning stalls until the reader drains.
//!
//! The channel manager enforces the priority policy: every read first
//! searches all active channels for control input, and only then -- if the
//! caller allows data at all -- returns a data line from the channel that
//! currently holds the data role.

use std::collections::VecDeque;

use heapless::Deque;
use tracing::{debug, warn};

use crate::{RX_BUFFER_SIZE, RX_LINE_LEN};

/// Number of outstanding skip records per channel.
const SKIP_SECTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Control,
    Data,
}

/// What the scanner produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A single-character command, extracted at start-of-line position.
    SingleChar(u8),
    /// A complete line (terminators stripped).
    Line { kind: LineKind, text: String },
    /// A line exceeded `RX_LINE_LEN` and was discarded whole.
    Overflow,
}

/// What the caller will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLimit {
    ControlOnly,
    Any,
}

#[derive(Debug, Clone, Copy)]
struct Skip {
    start: usize,
    end: usize,
}

/// A single channel's receive ring plus scanner state. Single producer
/// (transport), single consumer (dispatcher).
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Absolute (monotonic) offsets; index into the ring modulo capacity.
    read: usize,
    scan: usize,
    line_start: usize,
    write: usize,

    skips: Deque<Skip, SKIP_SECTIONS>,
    at_start_of_line: bool,
    ignore_until_next_line: bool,

    control_ready: VecDeque<LineEvent>,
    data_ready: VecDeque<LineEvent>,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; RX_BUFFER_SIZE],
            read: 0,
            scan: 0,
            line_start: 0,
            write: 0,
            skips: Deque::new(),
            at_start_of_line: true,
            ignore_until_next_line: false,
            control_ready: VecDeque::new(),
            data_ready: VecDeque::new(),
        }
    }

    /// Free space in the ring.
    pub fn space(&self) -> usize {
        RX_BUFFER_SIZE - (self.write - self.read)
    }

    /// Producer side: append transport bytes. Returns bytes accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        for &b in &bytes[..n] {
            let idx = self.write % RX_BUFFER_SIZE;
            self.buf[idx] = b;
            self.write += 1;
        }
        n
    }

    fn at(&self, offset: usize) -> u8 {
        self.buf[offset % RX_BUFFER_SIZE]
    }

    /// Incrementally scan newly written bytes, producing ready events.
    ///
    /// `percent_is_control` reflects the feedhold state: `%` is a queue
    /// flush only while a hold is active, otherwise it is line data.
    pub fn scan(&mut self, percent_is_control: bool) {
        while self.scan < self.write {
            let c = self.at(self.scan);

            // Line terminators: finish the line in progress; runs collapse.
            if c == b'\r' || c == b'\n' {
                if self.ignore_until_next_line {
                    // Close out the skip over the discarded remainder.
                    if self.install_skip(self.line_start, self.scan).is_err() {
                        return; // skip ring full: stall until reader drains
                    }
                    self.ignore_until_next_line = false;
                    self.control_ready.push_back(LineEvent::Overflow);
                } else if !self.at_start_of_line {
                    self.finish_line();
                }
                self.scan += 1;
                self.line_start = self.scan;
                self.at_start_of_line = true;
                self.advance_read();
                continue;
            }

            if self.ignore_until_next_line {
                self.scan += 1;
                continue;
            }

            // Single-character controls are only special at start-of-line:
            // a '!' inside a line body is data. (JSON strings containing
            // '!' rely on this.)
            if self.at_start_of_line
                && (c == b'!'
                    || c == b'~'
                    || (c == b'%' && percent_is_control)
                    || c == 0x04
                    || c == 0x05
                    || c == 0x18)
            {
                self.control_ready.push_back(LineEvent::SingleChar(c));
                self.scan += 1;
                self.line_start = self.scan;
                // read moves past just this byte
                self.advance_read();
                continue;
            }

            self.at_start_of_line = false;

            // Too long: discard the whole line so a truncated G-code block
            // is never executed.
            if self.scan - self.line_start >= RX_LINE_LEN {
                warn!(len = self.scan - self.line_start, "line overflow, discarding");
                self.ignore_until_next_line = true;
                continue;
            }
            self.scan += 1;
        }
    }

    fn finish_line(&mut self) {
        let mut text = String::with_capacity(self.scan - self.line_start);
        let mut offset = self.line_start;
        while offset < self.scan {
            // traverse skip records atomically
            if let Some(skip) = self.skips.front().copied() {
                if skip.start == offset {
                    offset = skip.end;
                    self.skips.pop_front();
                    continue;
                }
            }
            text.push(self.at(offset) as char);
            offset += 1;
        }
        let kind = if text.trim_start().starts_with('{') {
            LineKind::Control
        } else {
            LineKind::Data
        };
        match kind {
            LineKind::Control => self.control_ready.push_back(LineEvent::Line { kind, text }),
            LineKind::Data => self.data_ready.push_back(LineEvent::Line { kind, text }),
        }
    }

    fn install_skip(&mut self, start: usize, end: usize) -> Result<(), ()> {
        self.skips.push_back(Skip { start, end }).map_err(|_| ())
    }

    /// The read cursor trails the scanner; everything before the current
    /// line start has been consumed into ready events.
    fn advance_read(&mut self) {
        self.read = self.line_start.min(self.scan);
    }

    /// Take the next ready event of the allowed kinds. Control always
    /// drains first. Taking also drains skip records the read cursor has
    /// passed, un-stalling the scanner.
    pub fn take(&mut self, limit: ReadLimit) -> Option<LineEvent> {
        while let Some(skip) = self.skips.front().copied() {
            if skip.end <= self.read {
                self.skips.pop_front();
            } else {
                break;
            }
        }
        if let Some(ev) = self.control_ready.pop_front() {
            return Some(ev);
        }
        if limit == ReadLimit::Any {
            return self.data_ready.pop_front();
        }
        None
    }

    pub fn has_control(&self) -> bool {
        !self.control_ready.is_empty()
    }
}

/// Static channel policy bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelPolicy {
    /// Always carries both control and data (UART); never primary, never
    /// muted...
    pub always_both: bool,
    /// ...unless also tagged mute-as-secondary: then muted whenever any
    /// normal channel is connected.
    pub mute_as_secondary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connected,
    Ready,
    Active,
}

#[derive(Debug)]
struct Channel {
    buffer: LineBuffer,
    policy: ChannelPolicy,
    state: ChannelState,
    is_ctrl: bool,
    is_data: bool,
    is_primary: bool,
    is_muted: bool,
}

/// A mute-state change the dispatcher must announce on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteChange {
    pub channel: usize,
    pub muted: bool,
}

/// All physical channels and the control/data role assignment.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: Vec<Channel>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, policy: ChannelPolicy) -> usize {
        self.channels.push(Channel {
            buffer: LineBuffer::new(),
            policy,
            state: if policy.always_both {
                ChannelState::Active
            } else {
                ChannelState::Disconnected
            },
            is_ctrl: policy.always_both,
            is_data: policy.always_both,
            is_primary: false,
            is_muted: false,
        });
        self.channels.len() - 1
    }

    pub fn is_muted(&self, channel: usize) -> bool {
        self.channels[channel].is_muted
    }

    pub fn is_connected(&self, channel: usize) -> bool {
        self.channels[channel].state == ChannelState::Active
            || self.channels[channel].policy.always_both
    }

    /// A channel connected: assign roles. Returns mute transitions to
    /// announce.
    pub fn connect(&mut self, channel: usize) -> Vec<MuteChange> {
        let mut notices = Vec::new();
        {
            let ch = &mut self.channels[channel];
            ch.state = ChannelState::Active;
            if ch.policy.always_both {
                return notices;
            }
            ch.is_ctrl = true;
            ch.is_data = true;
        }

        // The newest normal channel takes the primary (control+data) role;
        // the older primary keeps control only.
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if i != channel && ch.is_primary {
                ch.is_primary = false;
                ch.is_data = false;
            }
        }
        self.channels[channel].is_primary = true;

        // Mute-as-secondary channels mute while any normal channel is up.
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if ch.policy.mute_as_secondary && !ch.is_muted {
                ch.is_muted = true;
                notices.push(MuteChange {
                    channel: i,
                    muted: true,
                });
            }
        }
        debug!(channel, "channel connected, primary role assigned");
        notices
    }

    pub fn disconnect(&mut self, channel: usize) -> Vec<MuteChange> {
        let mut notices = Vec::new();
        {
            let ch = &mut self.channels[channel];
            ch.state = ChannelState::Disconnected;
            ch.is_ctrl = ch.policy.always_both;
            ch.is_data = ch.policy.always_both;
            ch.is_primary = false;
        }

        let any_normal_connected = self
            .channels
            .iter()
            .any(|ch| !ch.policy.always_both && ch.state == ChannelState::Active);

        if !any_normal_connected {
            for (i, ch) in self.channels.iter_mut().enumerate() {
                if ch.policy.mute_as_secondary && ch.is_muted {
                    ch.is_muted = false;
                    notices.push(MuteChange {
                        channel: i,
                        muted: false,
                    });
                }
            }
        } else if let Some(newest) = self
            .channels
            .iter()
            .rposition(|ch| !ch.policy.always_both && ch.state == ChannelState::Active)
        {
            // promote the most recent surviving normal channel
            self.channels[newest].is_primary = true;
            self.channels[newest].is_data = true;
        }
        notices
    }

    /// Producer entry: feed transport bytes to a channel.
    pub fn feed(&mut self, channel: usize, bytes: &[u8]) -> usize {
        self.channels[channel].buffer.write(bytes)
    }

    /// Read the next line or single-char command, control first.
    ///
    /// Control pass: every active channel with the control role, in order.
    /// Data pass: only channels holding the data role, and only when the
    /// caller allows data. Lines from muted channels are returned flagged
    /// so the dispatcher can drop them with a notice.
    pub fn readline(
        &mut self,
        limit: ReadLimit,
        percent_is_control: bool,
    ) -> Option<(usize, LineEvent, bool)> {
        // control pass
        for i in 0..self.channels.len() {
            let ch = &mut self.channels[i];
            if ch.state != ChannelState::Active || !ch.is_ctrl {
                continue;
            }
            ch.buffer.scan(percent_is_control);
            if let Some(ev) = ch.buffer.take(ReadLimit::ControlOnly) {
                return Some((i, ev, ch.is_muted));
            }
        }
        if limit == ReadLimit::ControlOnly {
            return None;
        }
        // data pass
        for i in 0..self.channels.len() {
            let ch = &mut self.channels[i];
            if ch.state != ChannelState::Active || !ch.is_data {
                continue;
            }
            ch.buffer.scan(percent_is_control);
            if let Some(ev) = ch.buffer.take(ReadLimit::Any) {
                return Some((i, ev, ch.is_muted));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take_all(buf: &mut LineBuffer) -> Vec<LineEvent> {
        buf.scan(true);
        let mut out = Vec::new();
        while let Some(ev) = buf.take(ReadLimit::Any) {
            out.push(ev);
        }
        out
    }

    #[test]
    fn lines_classify_control_vs_data() {
        let mut buf = LineBuffer::new();
        buf.write(b"{sr:n}\nG1 X5 F600\n");
        let events = take_all(&mut buf);
        assert_eq!(
            events[0],
            LineEvent::Line {
                kind: LineKind::Control,
                text: "{sr:n}".into()
            }
        );
        assert_eq!(
            events[1],
            LineEvent::Line {
                kind: LineKind::Data,
                text: "G1 X5 F600".into()
            }
        );
    }

    #[test]
    fn single_char_extracted_without_terminator() {
        let mut buf = LineBuffer::new();
        buf.write(b"!");
        buf.scan(false);
        assert_eq!(buf.take(ReadLimit::ControlOnly), Some(LineEvent::SingleChar(b'!')));
    }

    #[test]
    fn single_char_only_at_start_of_line() {
        let mut buf = LineBuffer::new();
        buf.write(b"{msg:\"a!b\"}\n");
        let events = take_all(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            LineEvent::Line { kind: LineKind::Control, text } if text.contains('!')
        ));
    }

    #[test]
    fn percent_is_data_outside_hold() {
        let mut buf = LineBuffer::new();
        buf.write(b"%\n");
        buf.scan(false); // no feedhold
        assert!(buf.take(ReadLimit::ControlOnly).is_none());
        let ev = buf.take(ReadLimit::Any).unwrap();
        assert!(matches!(ev, LineEvent::Line { kind: LineKind::Data, .. }));

        let mut buf = LineBuffer::new();
        buf.write(b"%\n");
        buf.scan(true); // holding
        assert_eq!(buf.take(ReadLimit::ControlOnly), Some(LineEvent::SingleChar(b'%')));
    }

    #[test]
    fn terminator_runs_collapse() {
        let mut buf = LineBuffer::new();
        buf.write(b"G0 X1\r\n\r\n\nG0 X2\n");
        let events = take_all(&mut buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn control_preempts_queued_data() {
        let mut buf = LineBuffer::new();
        buf.write(b"G0 X1\n{qr:n}\n");
        buf.scan(true);
        // control comes out first even though data arrived first
        assert!(matches!(
            buf.take(ReadLimit::Any).unwrap(),
            LineEvent::Line { kind: LineKind::Control, .. }
        ));
        assert!(matches!(
            buf.take(ReadLimit::Any).unwrap(),
            LineEvent::Line { kind: LineKind::Data, .. }
        ));
    }

    #[test]
    fn overlong_line_discarded_whole() {
        let mut buf = LineBuffer::new();
        let long = vec![b'X'; RX_LINE_LEN + 100];
        buf.write(&long);
        buf.write(b"\nG0 X1\n");
        buf.scan(true);
        assert_eq!(buf.take(ReadLimit::Any), Some(LineEvent::Overflow));
        let ev = buf.take(ReadLimit::Any).unwrap();
        assert_eq!(
            ev,
            LineEvent::Line {
                kind: LineKind::Data,
                text: "G0 X1".into()
            }
        );
    }

    #[test]
    fn feedhold_burst_mid_stream() {
        let mut buf = LineBuffer::new();
        buf.write(b"G1 X100 F600\n!~\nG1 X0\n");
        buf.scan(true);
        // control first: the two single chars
        assert_eq!(buf.take(ReadLimit::Any), Some(LineEvent::SingleChar(b'!')));
        assert_eq!(buf.take(ReadLimit::Any), Some(LineEvent::SingleChar(b'~')));
        // then data in order
        assert!(matches!(
            buf.take(ReadLimit::Any).unwrap(),
            LineEvent::Line { kind: LineKind::Data, .. }
        ));
    }

    #[test]
    fn second_channel_takes_data_role() {
        let mut mgr = ChannelManager::new();
        let usb0 = mgr.add_channel(ChannelPolicy::default());
        let usb1 = mgr.add_channel(ChannelPolicy::default());
        mgr.connect(usb0);
        mgr.connect(usb1);

        mgr.feed(usb0, b"G0 X1\n");
        mgr.feed(usb1, b"G0 X2\n");
        // data comes only from the new primary
        let (ch, ev, _) = mgr.readline(ReadLimit::Any, false).unwrap();
        assert_eq!(ch, usb1);
        assert!(matches!(ev, LineEvent::Line { kind: LineKind::Data, .. }));

        // but control still flows from the old channel
        mgr.feed(usb0, b"{sr:n}\n");
        let (ch, ev, _) = mgr.readline(ReadLimit::Any, false).unwrap();
        assert_eq!(ch, usb0);
        assert!(matches!(ev, LineEvent::Line { kind: LineKind::Control, .. }));
    }

    #[test]
    fn mute_as_secondary_channel_mutes_and_unmutes() {
        let mut mgr = ChannelManager::new();
        let uart = mgr.add_channel(ChannelPolicy {
            always_both: true,
            mute_as_secondary: true,
        });
        let usb = mgr.add_channel(ChannelPolicy::default());

        let notices = mgr.connect(usb);
        assert_eq!(notices, vec![MuteChange { channel: uart, muted: true }]);
        assert!(mgr.is_muted(uart));

        let notices = mgr.disconnect(usb);
        assert_eq!(notices, vec![MuteChange { channel: uart, muted: false }]);
        assert!(!mgr.is_muted(uart));
    }
}
