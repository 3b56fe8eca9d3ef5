use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mosh_wire::constants::{QUENCH_INTERVAL_MS, RECEIVED_STATES_QUENCH_CAP};

use crate::error::{Error, Result};
use crate::protocol::Instruction;
use crate::sync_state::{SyncState, TimestampedState};

const QUENCH_INTERVAL: Duration = Duration::from_millis(QUENCH_INTERVAL_MS);

/// Result of handing one complete Instruction to the receiver.
pub struct Applied {
    /// Highest state number the sender has successfully applied, to be fed
    /// into the local-direction sender's `apply_ack`.
    pub ack_num: u64,
    pub throwaway_num: u64,
}

/// The receiving half of one direction of the synchronization protocol.
/// Holds the ordered list of remote states it has applied and rejects
/// anything that would break idempotency: replays, unknown base states,
/// and a queue grown past the quench cap.
pub struct TransportReceiver<S: SyncState> {
    received_states: VecDeque<TimestampedState<S>>,
    last_receiver_state: S,
    ack_num: u64,
    last_quench: Option<Instant>,
}

impl<S: SyncState> TransportReceiver<S> {
    pub fn new(initial_state: S, now: Instant) -> Self {
        let mut received_states = VecDeque::new();
        received_states.push_back(TimestampedState::new(now, 0, initial_state.clone()));
        Self {
            received_states,
            last_receiver_state: initial_state,
            ack_num: 0,
            last_quench: None,
        }
    }

    pub fn ack_num(&self) -> u64 {
        self.ack_num
    }

    /// Processes one complete Instruction. Returns `Ok(Some(..))` when the
    /// diff was applied, `Ok(None)` when the Instruction was silently
    /// dropped (replay, unknown base, quenched). A protocol version
    /// mismatch is fatal.
    ///
    /// `instr.ack_num`/`instr.throwaway_num` describe the remote's view of
    /// the *local* sender's sent states, not this Instruction's diff, so
    /// callers must feed them to that sender unconditionally as soon as
    /// this call returns `Ok(_)` — not only when the return value is
    /// `Some` — rather than reading them off the returned `Applied`.
    pub fn process_instruction(&mut self, instr: &Instruction, now: Instant) -> Result<Option<Applied>> {
        instr.check_version()?;

        if self.received_states.iter().any(|s| s.num == instr.new_num) {
            return Ok(None);
        }

        let Some(base_index) = self.received_states.iter().position(|s| s.num == instr.old_num)
        else {
            return Ok(None);
        };

        if self.received_states.len() > RECEIVED_STATES_QUENCH_CAP {
            let quenched_recently = self
                .last_quench
                .map(|t| now.saturating_duration_since(t) < QUENCH_INTERVAL)
                .unwrap_or(false);
            if quenched_recently {
                return Ok(None);
            }
            self.last_quench = Some(now);
        }

        let mut new_state = self.received_states[base_index].state.clone();
        new_state
            .apply_diff(&instr.diff)
            .map_err(Error::Decode)?;

        let insert_at = self
            .received_states
            .iter()
            .position(|s| s.num > instr.new_num)
            .unwrap_or(self.received_states.len());
        self.received_states.insert(
            insert_at,
            TimestampedState::new(now, instr.new_num, new_state),
        );

        self.ack_num = self.ack_num.max(instr.new_num);

        while self.received_states.len() > 1
            && self.received_states.front().unwrap().num < instr.throwaway_num
        {
            self.received_states.pop_front();
        }

        Ok(Some(Applied {
            ack_num: instr.ack_num,
            throwaway_num: instr.throwaway_num,
        }))
    }

    /// Returns the diff from the last state the application observed to
    /// the newest applied remote state, then rationalizes the queue
    /// against its own front so memory stays bounded.
    pub fn get_remote_diff(&mut self) -> Vec<u8> {
        let back_state = self.received_states.back().unwrap().state.clone();
        let diff = back_state.diff_from(&self.last_receiver_state);

        let front_state = self.received_states.front().unwrap().state.clone();
        for entry in self.received_states.iter_mut() {
            entry.state.subtract(&front_state);
        }

        self.last_receiver_state = back_state;
        diff
    }

    pub fn latest_state(&self) -> &S {
        &self.received_states.back().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Log(Vec<u8>);

    impl SyncState for Log {
        fn diff_from(&self, existing: &Self) -> Vec<u8> {
            self.0[existing.0.len()..].to_vec()
        }

        fn apply_diff(&mut self, diff: &[u8]) -> std::result::Result<(), String> {
            self.0.extend_from_slice(diff);
            Ok(())
        }

        fn subtract(&mut self, _prefix: &Self) {}
    }

    fn instr(old: u64, new: u64, diff: &[u8]) -> Instruction {
        Instruction::new(old, new, 0, 0, diff.to_vec())
    }

    #[test]
    fn idempotent_replay_is_dropped() {
        let now = Instant::now();
        let mut recv = TransportReceiver::new(Log(vec![]), now);
        let i1 = instr(0, 1, b"a");
        assert!(recv.process_instruction(&i1, now).unwrap().is_some());
        assert!(recv.process_instruction(&i1, now).unwrap().is_none());
        assert_eq!(recv.latest_state().0, b"a");
    }

    #[test]
    fn missing_base_state_is_dropped_silently() {
        let now = Instant::now();
        let mut recv = TransportReceiver::new(Log(vec![]), now);
        let i2 = instr(1, 2, b"b");
        assert!(recv.process_instruction(&i2, now).unwrap().is_none());
    }

    #[test]
    fn out_of_order_arrival_then_catch_up() {
        let now = Instant::now();
        let mut recv = TransportReceiver::new(Log(vec![]), now);
        let i1 = instr(0, 1, b"x");
        let i2 = instr(1, 2, b"y");

        assert!(recv.process_instruction(&i2, now).unwrap().is_none());
        assert!(recv.process_instruction(&i1, now).unwrap().is_some());
        assert!(recv.process_instruction(&i2, now).unwrap().is_some());
        assert_eq!(recv.latest_state().0, b"xy");
    }

    #[test]
    fn protocol_mismatch_is_fatal() {
        let now = Instant::now();
        let mut recv = TransportReceiver::new(Log(vec![]), now);
        let mut bad = instr(0, 1, b"x");
        bad.protocol_version = 99;
        assert!(matches!(
            recv.process_instruction(&bad, now),
            Err(Error::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn throwaway_trims_but_never_empties() {
        let now = Instant::now();
        let mut recv = TransportReceiver::new(Log(vec![]), now);
        recv.process_instruction(&instr(0, 1, b"a"), now).unwrap();
        let mut i2 = instr(1, 2, b"b");
        i2.throwaway_num = 5;
        recv.process_instruction(&i2, now).unwrap();
        assert!(!recv.received_states.is_empty());
    }
}
