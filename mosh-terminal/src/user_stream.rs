//! The user-input side of the synchronized state: an ordered queue of
//! keystroke bytes and resize events, diffed and applied the same way the
//! terminal state is.

use mosh_transport::SyncState;
use mosh_wire::MoshWire;

/// One item of user input: a single input byte (interpretation is left to
/// the remote parser) or a terminal resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, MoshWire)]
pub enum UserEvent {
    Byte(u8),
    Resize { width: u16, height: u16 },
}

/// An ordered queue of [`UserEvent`]s. `diff_from` only ever looks at a
/// queue it is a superset of (the transport only asks for diffs against
/// states it previously held), so the shared prefix can be located by
/// straight comparison rather than a general sequence diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, MoshWire)]
pub struct UserStream {
    actions: Vec<UserEvent>,
}

impl UserStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.actions.push(UserEvent::Byte(byte));
    }

    pub fn push_resize(&mut self, width: u16, height: u16) {
        self.actions.push(UserEvent::Resize { width, height });
    }

    pub fn actions(&self) -> &[UserEvent] {
        &self.actions
    }
}

/// Wire form of a diff: consecutive [`UserEvent::Byte`]s are coalesced into
/// one keystroke run, mirroring the reference's combined-keystroke
/// extension so a burst of typing costs one length-prefixed run rather
/// than N single-byte instructions.
#[derive(Debug, Clone, PartialEq, Eq, MoshWire)]
enum WireInstruction {
    Keystroke(Vec<u8>),
    Resize { width: u16, height: u16 },
}

impl SyncState for UserStream {
    fn diff_from(&self, existing: &Self) -> Vec<u8> {
        debug_assert!(self.actions.starts_with(&existing.actions));

        let mut instructions: Vec<WireInstruction> = Vec::new();
        for action in &self.actions[existing.actions.len().min(self.actions.len())..] {
            match action {
                UserEvent::Byte(b) => {
                    if let Some(WireInstruction::Keystroke(keys)) = instructions.last_mut() {
                        keys.push(*b);
                    } else {
                        instructions.push(WireInstruction::Keystroke(vec![*b]));
                    }
                }
                UserEvent::Resize { width, height } => {
                    instructions.push(WireInstruction::Resize {
                        width: *width,
                        height: *height,
                    });
                }
            }
        }

        mosh_wire::serialize(&instructions).unwrap_or_default()
    }

    fn apply_diff(&mut self, diff: &[u8]) -> Result<(), String> {
        if diff.is_empty() {
            return Ok(());
        }
        let instructions: Vec<WireInstruction> =
            mosh_wire::deserialize(diff).map_err(|e| e.to_string())?;
        for instruction in instructions {
            match instruction {
                WireInstruction::Keystroke(keys) => {
                    self.actions.extend(keys.into_iter().map(UserEvent::Byte));
                }
                WireInstruction::Resize { width, height } => {
                    self.actions.push(UserEvent::Resize { width, height });
                }
            }
        }
        Ok(())
    }

    /// Drops the shared prefix with `prefix`. The transport calls this only
    /// with a `prefix` it previously produced as `self`, so the assertion
    /// that it is indeed a prefix is load-bearing, not defensive.
    fn subtract(&mut self, prefix: &Self) {
        if std::ptr::eq(self, prefix) {
            self.actions.clear();
            return;
        }
        debug_assert!(self.actions.starts_with(&prefix.actions));
        self.actions.drain(..prefix.actions.len().min(self.actions.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_then_apply_reconstructs_stream() {
        let mut full = UserStream::new();
        full.push_byte(b'a');
        full.push_byte(b'b');
        full.push_resize(80, 24);
        full.push_byte(b'c');

        let existing = UserStream::new();
        let diff = full.diff_from(&existing);

        let mut reconstructed = existing;
        reconstructed.apply_diff(&diff).unwrap();
        assert_eq!(reconstructed, full);
    }

    #[test]
    fn diff_from_partial_prefix_only_sends_remainder() {
        let mut existing = UserStream::new();
        existing.push_byte(b'a');

        let mut full = existing.clone();
        full.push_byte(b'b');
        full.push_byte(b'c');

        let diff = full.diff_from(&existing);
        let mut reconstructed = existing.clone();
        reconstructed.apply_diff(&diff).unwrap();
        assert_eq!(reconstructed, full);
    }

    #[test]
    fn subtract_drops_shared_prefix() {
        let mut existing = UserStream::new();
        existing.push_byte(b'a');
        existing.push_byte(b'b');

        let mut full = existing.clone();
        full.push_byte(b'c');

        full.subtract(&existing);
        assert_eq!(full.actions(), &[UserEvent::Byte(b'c')]);
    }

    #[test]
    fn consecutive_bytes_coalesce_into_one_keystroke_run() {
        let mut full = UserStream::new();
        full.push_byte(b'x');
        full.push_byte(b'y');
        full.push_byte(b'z');

        let diff = full.diff_from(&UserStream::new());
        let instructions: Vec<WireInstruction> = mosh_wire::deserialize(&diff).unwrap();
        assert_eq!(instructions, vec![WireInstruction::Keystroke(vec![b'x', b'y', b'z'])]);
    }
}
