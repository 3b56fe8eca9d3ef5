use crate::error::{Error, Result};
use crate::protocol::{Fragment, Instruction, MAX_FRAGMENT_NUM};

/// Fixed allowance subtracted from the MTU for fragment + datagram headers
/// before computing how much Instruction payload fits per fragment.
pub const FRAGMENT_HEADER_ALLOWANCE: usize = 66;

/// Splits Instructions into MTU-sized fragments, reusing the same
/// `instruction_id` across sends whose routing header hasn't changed so
/// that a stray earlier fragment can still complete a later assembly.
#[derive(Debug)]
pub struct Fragmenter {
    next_instruction_id: u64,
    last_header: Option<(u64, u64, u64, u64, u32, usize)>,
    last_instruction_id: u64,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragmenter {
    pub fn new() -> Self {
        Self {
            next_instruction_id: 0,
            last_header: None,
            last_instruction_id: 0,
        }
    }

    pub fn make_fragments(&mut self, instruction: &Instruction, mtu: usize) -> Result<Vec<Fragment>> {
        let header = (
            instruction.old_num,
            instruction.new_num,
            instruction.ack_num,
            instruction.throwaway_num,
            instruction.protocol_version,
            mtu,
        );

        let instruction_id = if self.last_header == Some(header) {
            self.last_instruction_id
        } else {
            let id = self.next_instruction_id;
            self.next_instruction_id += 1;
            self.last_header = Some(header);
            self.last_instruction_id = id;
            id
        };

        let payload = mosh_wire::serialize(instruction).map_err(|e| Error::Decode(e.to_string()))?;
        let chunk_size = mtu.saturating_sub(FRAGMENT_HEADER_ALLOWANCE).max(1);

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&payload[..]]
        } else {
            payload.chunks(chunk_size).collect()
        };

        if chunks.len() - 1 > MAX_FRAGMENT_NUM as usize {
            return Err(Error::Decode("instruction too large to fragment".into()));
        }

        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Fragment::new(instruction_id, i as u16, i == last, chunk.to_vec()))
            .collect())
    }
}

/// Reassembles fragments sharing one `instruction_id` into the concatenated
/// Instruction payload. A new id arriving mid-assembly discards the
/// in-progress buffer.
#[derive(Debug)]
pub struct Assembler {
    instruction_id: Option<u64>,
    fragments: Vec<Option<Vec<u8>>>,
    total: Option<usize>,
    received: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            instruction_id: None,
            fragments: Vec::new(),
            total: None,
            received: 0,
        }
    }

    /// Feeds one fragment in. Returns the reassembled Instruction once every
    /// fragment of its `instruction_id` has arrived.
    pub fn add_fragment(&mut self, fragment: Fragment) -> Result<Option<Instruction>> {
        if self.instruction_id != Some(fragment.instruction_id) {
            self.instruction_id = Some(fragment.instruction_id);
            self.fragments.clear();
            self.total = None;
            self.received = 0;
        }

        let idx = fragment.fragment_num() as usize;
        if fragment.is_final() {
            self.total = Some(idx + 1);
        }

        if idx >= self.fragments.len() {
            self.fragments.resize(idx + 1, None);
        }

        match &self.fragments[idx] {
            Some(existing) if existing != &fragment.body => {
                return Err(Error::Decode(format!(
                    "duplicate fragment {idx} with differing contents for instruction {}",
                    fragment.instruction_id
                )));
            }
            Some(_) => return Ok(None),
            None => {
                self.fragments[idx] = Some(fragment.body);
                self.received += 1;
            }
        }

        let Some(total) = self.total else {
            return Ok(None);
        };

        if self.received < total || self.fragments.len() < total {
            return Ok(None);
        }

        let mut payload = Vec::new();
        for slot in &self.fragments {
            match slot {
                Some(bytes) => payload.extend_from_slice(bytes),
                None => return Ok(None),
            }
        }

        let instruction: Instruction = mosh_wire::deserialize(&payload)
            .map_err(|e| Error::Decode(e.to_string()))?;

        self.instruction_id = None;
        self.fragments.clear();
        self.total = None;
        self.received = 0;

        Ok(Some(instruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_round_trip() {
        let instruction = Instruction::new(0, 1, 0, 0, b"hello".to_vec());
        let mut fragmenter = Fragmenter::new();
        let fragments = fragmenter.make_fragments(&instruction, 1400).unwrap();
        assert_eq!(fragments.len(), 1);

        let mut assembler = Assembler::new();
        let reassembled = assembler.add_fragment(fragments.into_iter().next().unwrap()).unwrap();
        assert_eq!(reassembled, Some(instruction));
    }

    #[test]
    fn multi_fragment_round_trip_out_of_order() {
        let instruction = Instruction::new(0, 1, 0, 0, vec![7u8; 500]);
        let mut fragmenter = Fragmenter::new();
        let mut fragments = fragmenter.make_fragments(&instruction, 100).unwrap();
        assert!(fragments.len() > 1);
        fragments.reverse();

        let mut assembler = Assembler::new();
        let mut result = None;
        for fragment in fragments {
            result = assembler.add_fragment(fragment).unwrap();
        }
        assert_eq!(result, Some(instruction));
    }

    #[test]
    fn reused_instruction_id_when_header_unchanged() {
        let mut fragmenter = Fragmenter::new();
        let i1 = Instruction::new(0, 1, 0, 0, b"a".to_vec());
        let i2 = Instruction::new(0, 1, 0, 0, b"b".to_vec());
        let f1 = fragmenter.make_fragments(&i1, 1400).unwrap();
        let f2 = fragmenter.make_fragments(&i2, 1400).unwrap();
        assert_eq!(f1[0].instruction_id, f2[0].instruction_id);
    }

    #[test]
    fn new_header_allocates_new_instruction_id() {
        let mut fragmenter = Fragmenter::new();
        let i1 = Instruction::new(0, 1, 0, 0, b"a".to_vec());
        let i2 = Instruction::new(0, 2, 0, 0, b"a".to_vec());
        let f1 = fragmenter.make_fragments(&i1, 1400).unwrap();
        let f2 = fragmenter.make_fragments(&i2, 1400).unwrap();
        assert_ne!(f1[0].instruction_id, f2[0].instruction_id);
    }
}
