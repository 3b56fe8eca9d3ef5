use std::collections::VecDeque;
use std::time::{Duration, Instant};

use mosh_wire::constants::{
    SENT_STATES_ERASE_FROM_END, SENT_STATES_SOFT_CAP,
};
use rand::RngCore;

use crate::connection::Connection;
use crate::error::Result;
use crate::fragment::Fragmenter;
use crate::protocol::{Instruction, SHUTDOWN};
use crate::sync_state::{SyncState, TimestampedState};

pub const SEND_INTERVAL_MIN: Duration = Duration::from_millis(20);
pub const SEND_INTERVAL_MAX: Duration = Duration::from_millis(250);
pub const ACK_INTERVAL: Duration = Duration::from_millis(3000);
pub const ACK_DELAY: Duration = Duration::from_millis(100);
pub const SEND_MINDELAY: Duration = Duration::from_millis(8);
pub const SHUTDOWN_RETRIES: u32 = 16;
pub const ACTIVE_RETRY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Progress of a graceful close. `Running` is the only state in which
/// `current_state` may be mutated; once shutdown begins it is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    ShutdownAcknowledged,
    ShutdownAckTimedOut,
}

/// The sending half of one direction of the synchronization protocol.
/// Owns the live application state (`current_state`) directly, mirroring
/// how the reference client hangs its `UserStream`/`Complete` off the
/// transport rather than keeping it elsewhere.
pub struct TransportSender<S: SyncState> {
    current_state: S,
    sent_states: VecDeque<TimestampedState<S>>,

    assumed_receiver_num: u64,
    assumed_receiver_state: S,

    fragmenter: Fragmenter,

    next_ack_time: Instant,
    next_send_time: Option<Instant>,

    /// Highest remote state number we have applied; echoed to the peer as
    /// `ack_num` on every Instruction we send.
    ack_num: u64,
    pending_data_ack: bool,

    shutdown: ShutdownState,
    shutdown_tries: u32,
    shutdown_start: Option<Instant>,

    mindelay_clock: Option<Instant>,
    last_heard: Instant,
}

impl<S: SyncState> TransportSender<S> {
    pub fn new(initial_state: S, now: Instant) -> Self {
        let mut sent_states = VecDeque::new();
        sent_states.push_back(TimestampedState::new(now, 0, initial_state.clone()));
        Self {
            current_state: initial_state.clone(),
            sent_states,
            assumed_receiver_num: 0,
            assumed_receiver_state: initial_state,
            fragmenter: Fragmenter::new(),
            next_ack_time: now,
            next_send_time: None,
            ack_num: 0,
            pending_data_ack: false,
            shutdown: ShutdownState::Running,
            shutdown_tries: 0,
            shutdown_start: None,
            mindelay_clock: None,
            last_heard: now,
        }
    }

    pub fn current_state(&self) -> &S {
        &self.current_state
    }

    /// Mutable access to the live state, e.g. to push a new user byte.
    /// Returns `None` once shutdown has begun, since the state is frozen
    /// from that point on and must not be mutated further.
    pub fn current_state_mut(&mut self) -> Option<&mut S> {
        match self.shutdown {
            ShutdownState::Running => Some(&mut self.current_state),
            _ => None,
        }
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// The state number of the most recent frame handed to the transport,
    /// whether or not the peer has acknowledged it yet.
    pub fn last_sent_num(&self) -> u64 {
        self.sent_states.back().unwrap().num
    }

    pub fn start_shutdown(&mut self, now: Instant) {
        if self.shutdown == ShutdownState::Running {
            self.shutdown = ShutdownState::ShuttingDown;
            self.shutdown_start = Some(now);
            self.shutdown_tries = 0;
        }
    }

    /// Peer has acked our shutdown, or we have acked theirs and may close.
    pub fn note_shutdown_acknowledged(&mut self) {
        if matches!(
            self.shutdown,
            ShutdownState::ShuttingDown | ShutdownState::Running
        ) {
            self.shutdown = ShutdownState::ShutdownAcknowledged;
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.shutdown,
            ShutdownState::ShutdownAcknowledged | ShutdownState::ShutdownAckTimedOut
        )
    }

    /// Feeds `ack_num`/`throwaway_num` observed on an incoming Instruction:
    /// trims every sent state numbered below `ack_num`, always keeping the
    /// front.
    pub fn apply_ack(&mut self, ack_num: u64, _throwaway_num: u64) {
        while self.sent_states.len() > 1 {
            let Some(front) = self.sent_states.front() else { break };
            if front.num < ack_num {
                self.sent_states.pop_front();
            } else {
                break;
            }
        }
        self.pending_data_ack = false;
    }

    pub fn note_heard_from_peer(&mut self, now: Instant) {
        self.last_heard = now;
    }

    fn send_interval(&self, srtt: Duration) -> Duration {
        (srtt / 2).clamp(SEND_INTERVAL_MIN, SEND_INTERVAL_MAX)
    }

    /// Runs the scheduling algorithm (spec S4.5) and, if a send is due,
    /// encrypts and transmits an Instruction over `connection`.
    pub fn tick(&mut self, now: Instant, connection: &mut Connection) -> Result<()> {
        let timeout = connection.timeout();
        let srtt = connection.srtt();
        let send_interval = self.send_interval(srtt);

        self.advance_assumed_receiver(now, timeout);

        let front_state = self.sent_states.front().unwrap().state.clone();
        self.current_state.subtract(&front_state);
        for entry in self.sent_states.iter_mut() {
            entry.state.subtract(&front_state);
        }
        self.assumed_receiver_state.subtract(&front_state);

        if self.pending_data_ack {
            self.next_ack_time = self.next_ack_time.min(now + ACK_DELAY);
        }

        let back_state = self.sent_states.back().unwrap().state.clone();
        let back_timestamp = self.sent_states.back().unwrap().timestamp;

        if self.current_state != back_state {
            let mindelay_clock = *self.mindelay_clock.get_or_insert(now);
            self.next_send_time = Some(
                (mindelay_clock + SEND_MINDELAY).max(back_timestamp + send_interval),
            );
        } else if self.current_state != self.assumed_receiver_state {
            if now.saturating_duration_since(self.last_heard) < ACTIVE_RETRY_TIMEOUT {
                self.next_send_time = Some(back_timestamp + send_interval);
            } else {
                self.next_send_time = Some(back_timestamp + timeout + ACK_DELAY);
            }
        } else if self.current_state != front_state {
            self.next_send_time = Some(back_timestamp + timeout + ACK_DELAY);
        }

        let shutting_down = self.shutdown == ShutdownState::ShuttingDown;
        if shutting_down || self.ack_num == SHUTDOWN {
            self.next_send_time = Some(
                self.next_send_time
                    .unwrap_or(now)
                    .min(back_timestamp + send_interval),
            );
        }

        let diff = self.current_state.diff_from(&self.assumed_receiver_state);

        if diff.is_empty() {
            if now >= self.next_ack_time {
                self.send_instruction(connection, self.assumed_receiver_num, Vec::new(), now, shutting_down);
                self.next_ack_time = now + ACK_INTERVAL;
            }
            return Ok(());
        }

        let due = self.next_send_time.map(|t| now >= t).unwrap_or(false);
        if !due {
            return Ok(());
        }

        let (old_num, chosen_diff) = self.choose_diff(&diff, &front_state);
        self.send_instruction(connection, old_num, chosen_diff, now, shutting_down);

        self.next_ack_time = now + ACK_INTERVAL;
        self.next_send_time = None;
        self.mindelay_clock = None;

        Ok(())
    }

    /// The prospective-resend optimization: prefer a diff from the
    /// acknowledged front state over one from the assumed-receiver state
    /// when it is no more than marginally longer, recovering a lost frame
    /// without waiting for retransmit logic to kick in.
    fn choose_diff(&mut self, assumed_diff: &[u8], front_state: &S) -> (u64, Vec<u8>) {
        let resend_diff = self.current_state.diff_from(front_state);
        let front_num = self.sent_states.front().unwrap().num;

        let prefer_resend = resend_diff.len() <= assumed_diff.len()
            || (resend_diff.len() <= assumed_diff.len() + 100 && resend_diff.len() < 1000);

        if prefer_resend {
            self.assumed_receiver_num = front_num;
            self.assumed_receiver_state = front_state.clone();
            (front_num, resend_diff)
        } else {
            (self.assumed_receiver_num, assumed_diff.to_vec())
        }
    }

    fn send_instruction(
        &mut self,
        connection: &mut Connection,
        old_num: u64,
        diff: Vec<u8>,
        now: Instant,
        shutting_down: bool,
    ) {
        let is_empty_ack = diff.is_empty();
        let new_num = if shutting_down {
            SHUTDOWN
        } else {
            self.sent_states.back().unwrap().num + 1
        };

        let chaff = random_chaff();
        let throwaway_num = self.sent_states.front().unwrap().num;
        let instruction = Instruction::new(old_num, new_num, self.ack_num, throwaway_num, diff)
            .with_chaff(chaff);

        let mtu = connection.mtu();
        if let Ok(fragments) = self.fragmenter.make_fragments(&instruction, mtu) {
            for fragment in fragments {
                if let Ok(bytes) = mosh_wire::serialize(&fragment) {
                    connection.send(&bytes);
                }
            }
        }

        if shutting_down {
            self.shutdown_tries += 1;
        }

        if !is_empty_ack {
            self.sent_states
                .push_back(TimestampedState::new(now, new_num, self.current_state.clone()));
            self.assumed_receiver_num = new_num;
            self.assumed_receiver_state = self.current_state.clone();
            self.bound_sent_states();
        } else {
            self.sent_states
                .push_back(TimestampedState::new(now, new_num, self.current_state.clone()));
            self.bound_sent_states();
        }
    }

    fn advance_assumed_receiver(&mut self, now: Instant, timeout: Duration) {
        let grace = timeout + ACK_DELAY;
        let mut candidate_num = self.sent_states.front().unwrap().num;
        let mut candidate_state = self.sent_states.front().unwrap().state.clone();

        for entry in self.sent_states.iter() {
            if now.saturating_duration_since(entry.timestamp) < grace {
                candidate_num = entry.num;
                candidate_state = entry.state.clone();
            } else {
                break;
            }
        }

        self.assumed_receiver_num = candidate_num;
        self.assumed_receiver_state = candidate_state;
    }

    /// Keeps `sent_states` under the soft cap by erasing one interior
    /// element (never the endpoints) rather than letting it grow without
    /// bound, mirroring the reference's deque-with-interior-erasure.
    fn bound_sent_states(&mut self) {
        if self.sent_states.len() > SENT_STATES_SOFT_CAP {
            let idx = self.sent_states.len() - SENT_STATES_ERASE_FROM_END;
            if idx > 0 && idx < self.sent_states.len() - 1 {
                self.sent_states.remove(idx);
            }
        }
    }

    /// Called when the application wants to request or note that a data
    /// ack should be sent promptly (e.g. after applying an incoming diff).
    pub fn request_prompt_ack(&mut self) {
        self.pending_data_ack = true;
    }

    pub fn note_remote_ack_num(&mut self, ack_num: u64) {
        self.ack_num = self.ack_num.max(ack_num);
    }

    /// Whether shutdown should be declared permanently timed out.
    pub fn check_shutdown_timeout(&mut self, now: Instant) {
        if self.shutdown != ShutdownState::ShuttingDown {
            return;
        }
        let Some(start) = self.shutdown_start else { return };
        if self.shutdown_tries >= SHUTDOWN_RETRIES || now.saturating_duration_since(start) >= ACTIVE_RETRY_TIMEOUT {
            self.shutdown = ShutdownState::ShutdownAckTimedOut;
        }
    }

    pub fn wait_time(&self, now: Instant) -> Duration {
        let candidates = [Some(self.next_ack_time), self.next_send_time];
        candidates
            .into_iter()
            .flatten()
            .map(|t| t.saturating_duration_since(now))
            .min()
            .unwrap_or(ACK_INTERVAL)
    }
}

fn random_chaff() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = (rng.next_u32() % 17) as usize;
    let mut chaff = vec![0u8; len];
    rng.fill_bytes(&mut chaff);
    chaff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counter(u32);

    impl SyncState for Counter {
        fn diff_from(&self, existing: &Self) -> Vec<u8> {
            if self.0 == existing.0 {
                Vec::new()
            } else {
                self.0.to_be_bytes().to_vec()
            }
        }

        fn apply_diff(&mut self, diff: &[u8]) -> std::result::Result<(), String> {
            if diff.len() != 4 {
                return Err("bad diff".into());
            }
            self.0 = u32::from_be_bytes(diff.try_into().unwrap());
            Ok(())
        }

        fn subtract(&mut self, _prefix: &Self) {}
    }

    #[test]
    fn sent_states_queue_never_empty() {
        let now = Instant::now();
        let sender = TransportSender::new(Counter(0), now);
        assert!(!sender.sent_states.is_empty());
    }

    #[test]
    fn ack_never_decreases_front() {
        let now = Instant::now();
        let mut sender = TransportSender::new(Counter(0), now);
        sender.sent_states.push_back(TimestampedState::new(now, 1, Counter(1)));
        sender.sent_states.push_back(TimestampedState::new(now, 2, Counter(2)));
        sender.apply_ack(2, 0);
        assert_eq!(sender.sent_states.front().unwrap().num, 2);
        sender.apply_ack(0, 0);
        assert_eq!(sender.sent_states.front().unwrap().num, 2);
    }

    #[test]
    fn shutdown_times_out_after_retries() {
        let now = Instant::now();
        let mut sender = TransportSender::new(Counter(0), now);
        sender.start_shutdown(now);
        sender.shutdown_tries = SHUTDOWN_RETRIES;
        sender.check_shutdown_timeout(now);
        assert_eq!(sender.shutdown_state(), ShutdownState::ShutdownAckTimedOut);
    }

    #[test]
    fn shutdown_times_out_after_active_retry_window() {
        let now = Instant::now();
        let mut sender = TransportSender::new(Counter(0), now);
        sender.start_shutdown(now);
        sender.check_shutdown_timeout(now + ACTIVE_RETRY_TIMEOUT);
        assert_eq!(sender.shutdown_state(), ShutdownState::ShutdownAckTimedOut);
    }
}
