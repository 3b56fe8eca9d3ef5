//! The terminal-side synchronized state: a full VT emulator plus the
//! client's echo-acknowledgement bookkeeping, diffed as a single unit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mosh_transport::SyncState;
use mosh_wire::MoshWire;

use crate::display;
use crate::emulator::Emulator;
use crate::framebuffer::Framebuffer;
use crate::parser::{Parser, Utf8Decoder};

/// How far back an input frame can be acknowledged by the echo timer
/// before it's considered too old to matter.
const ECHO_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, MoshWire)]
enum WireInstruction {
    HostBytes(String),
    Resize { width: u16, height: u16 },
    EchoAck(u64),
}

/// Wraps an [`Emulator`] with the input-history bookkeeping needed to
/// compute `echo_ack`: the highest-numbered local input frame whose effect
/// on the screen the client can be sure has arrived, so it can stop
/// predicting that far back.
pub struct CompleteTerminal {
    decoder: Utf8Decoder,
    parser: Parser,
    terminal: Emulator,
    echo_ack: u64,
    input_history: VecDeque<(u64, Instant)>,
}

impl Clone for CompleteTerminal {
    fn clone(&self) -> Self {
        Self {
            decoder: Utf8Decoder::default(),
            parser: Parser::default(),
            terminal: self.terminal.clone(),
            echo_ack: self.echo_ack,
            input_history: self.input_history.clone(),
        }
    }
}

impl PartialEq for CompleteTerminal {
    /// Parser/decoder state is transient reassembly scratch, not part of
    /// the synchronized terminal state, so it's excluded from comparison.
    fn eq(&self, other: &Self) -> bool {
        self.terminal == other.terminal && self.echo_ack == other.echo_ack
    }
}

impl CompleteTerminal {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            decoder: Utf8Decoder::default(),
            parser: Parser::default(),
            terminal: Emulator::new(width, height),
            echo_ack: 0,
            input_history: VecDeque::new(),
        }
    }

    pub fn fb(&self) -> &Framebuffer {
        self.terminal.fb()
    }

    pub fn echo_ack(&self) -> u64 {
        self.echo_ack
    }

    /// Feeds a chunk of host output through the UTF-8 decoder and VT
    /// parser, returning any bytes the terminal wants echoed back (DSR/DA
    /// replies).
    pub fn act(&mut self, bytes: &[u8]) -> Vec<u8> {
        for &byte in bytes {
            for ch in self.decoder.push(byte) {
                for action in self.parser.input(ch) {
                    self.terminal.act(&action);
                }
            }
        }
        self.terminal.take_to_host()
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.terminal.resize(width, height);
    }

    /// Records that local input frame `n` was sent at `now`, for later
    /// echo-ack computation.
    pub fn register_input_frame(&mut self, n: u64, now: Instant) {
        self.input_history.push_back((n, now));
    }

    /// Sets `echo_ack` to the newest input frame old enough that its echo
    /// (if any) must have already arrived, then prunes history older than
    /// that.
    pub fn set_echo_ack(&mut self, now: Instant) {
        let mut newest_acknowledgeable = None;
        for &(n, sent) in &self.input_history {
            if now.saturating_duration_since(sent) >= ECHO_TIMEOUT {
                newest_acknowledgeable = Some(n);
            }
        }
        if let Some(n) = newest_acknowledgeable {
            if n > self.echo_ack {
                self.echo_ack = n;
            }
            self.input_history.retain(|&(frame, _)| frame > n);
        }
    }

    /// Time to wait before the next echo-ack deadline elapses, if any
    /// input is still outstanding.
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        self.input_history.front().map(|&(_, sent)| {
            let elapsed = now.saturating_duration_since(sent);
            ECHO_TIMEOUT.saturating_sub(elapsed)
        })
    }
}

impl SyncState for CompleteTerminal {
    fn diff_from(&self, existing: &Self) -> Vec<u8> {
        let mut instructions = Vec::new();

        if existing.echo_ack != self.echo_ack {
            debug_assert!(self.echo_ack >= existing.echo_ack);
            instructions.push(WireInstruction::EchoAck(self.echo_ack));
        }

        let old_fb = existing.fb();
        let new_fb = self.fb();
        if old_fb.width() != new_fb.width() || old_fb.height() != new_fb.height() {
            instructions.push(WireInstruction::Resize {
                width: new_fb.width() as u16,
                height: new_fb.height() as u16,
            });
        }

        let hostbytes = display::new_frame(true, old_fb, new_fb);
        if !hostbytes.is_empty() || instructions.is_empty() {
            instructions.push(WireInstruction::HostBytes(hostbytes));
        }

        mosh_wire::serialize(&instructions).unwrap_or_default()
    }

    fn apply_diff(&mut self, diff: &[u8]) -> Result<(), String> {
        let instructions: Vec<WireInstruction> =
            mosh_wire::deserialize(diff).map_err(|e| e.to_string())?;

        for instruction in instructions {
            match instruction {
                WireInstruction::HostBytes(s) => {
                    let reply = self.act(s.as_bytes());
                    if !reply.is_empty() {
                        return Err("terminal produced a reply to server-sent bytes".to_string());
                    }
                }
                WireInstruction::Resize { width, height } => {
                    self.resize(width as usize, height as usize);
                }
                WireInstruction::EchoAck(ack) => {
                    if ack < self.echo_ack {
                        return Err("echo_ack must not decrease".to_string());
                    }
                    self.echo_ack = ack;
                }
            }
        }
        Ok(())
    }

    /// The terminal state carries no history to rationalize against a
    /// prefix -- each `diff_from` call already computes a fresh diff
    /// against whatever `existing` is passed, so there's nothing to do.
    fn subtract(&mut self, _prefix: &Self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal_with(text: &[u8]) -> CompleteTerminal {
        let mut t = CompleteTerminal::new(10, 3);
        t.act(text);
        t
    }

    #[test]
    fn diff_then_apply_reconstructs_screen_contents() {
        let existing = CompleteTerminal::new(10, 3);
        let full = terminal_with(b"hello");

        let diff = full.diff_from(&existing);
        let mut reconstructed = existing;
        reconstructed.apply_diff(&diff).unwrap();

        assert_eq!(reconstructed.fb().row(0).cell(0).contents(), &['h']);
    }

    #[test]
    fn unchanged_terminal_diffs_to_no_visible_change() {
        let a = terminal_with(b"hi");
        let b = terminal_with(b"hi");
        let diff = a.diff_from(&b);
        let mut reconstructed = b.clone();
        reconstructed.apply_diff(&diff).unwrap();
        assert_eq!(reconstructed.fb(), a.fb());
    }

    #[test]
    fn resize_is_carried_in_diff() {
        let existing = CompleteTerminal::new(10, 3);
        let mut full = CompleteTerminal::new(10, 3);
        full.resize(20, 6);

        let diff = full.diff_from(&existing);
        let mut reconstructed = existing;
        reconstructed.apply_diff(&diff).unwrap();
        assert_eq!(reconstructed.fb().width(), 20);
        assert_eq!(reconstructed.fb().height(), 6);
    }

    #[test]
    fn echo_ack_becomes_acknowledgeable_after_timeout() {
        let mut t = CompleteTerminal::new(10, 3);
        let t0 = Instant::now();
        t.register_input_frame(1, t0);
        t.set_echo_ack(t0);
        assert_eq!(t.echo_ack(), 0);

        let later = t0 + Duration::from_millis(60);
        t.set_echo_ack(later);
        assert_eq!(t.echo_ack(), 1);
    }

    #[test]
    fn equality_ignores_parser_state_but_not_echo_ack() {
        let mut a = CompleteTerminal::new(10, 3);
        let b = CompleteTerminal::new(10, 3);
        a.act(b"\x1b[");
        assert_eq!(a, b);

        let mut c = CompleteTerminal::new(10, 3);
        let t0 = Instant::now();
        c.register_input_frame(5, t0);
        c.set_echo_ack(t0 + Duration::from_millis(60));
        assert_ne!(a, c);
    }
}
