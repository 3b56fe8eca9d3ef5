//! A direct implementation of Paul Williams's DEC/ECMA-48 parser diagram,
//! plus a UTF-8 decoding layer in front of it. Actions are a tagged enum
//! matched by the caller rather than a dispatched class hierarchy.

use smallvec::SmallVec;

/// One output of the state machine for a single input code point. A single
/// input can yield up to three actions (e.g. exit old state, the
/// triggering action, enter new state), so callers collect a small vec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Print(char),
    Execute(char),
    Clear,
    Collect(char),
    Param(char),
    EscDispatch(char),
    CsiDispatch(char),
    Hook,
    Put(char),
    Unhook,
    OscStart,
    OscPut(char),
    OscEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    CsiIgnore,
    DcsEntry,
    DcsParam,
    DcsIntermediate,
    DcsPassthrough,
    DcsIgnore,
    OscString,
    SosPmApcString,
}

type Actions = SmallVec<[Action; 3]>;

fn is_c0(cp: u32) -> bool {
    matches!(cp, 0x00..=0x17 | 0x19 | 0x1c..=0x1f)
}

/// The handful of 8-bit C1 codes and other codepoints handled by the
/// "anywhere" rule, independent of the current state.
fn anywhere(cp: u32) -> Option<(Actions, State)> {
    match cp {
        0x18 | 0x1a => Some((smallvec::smallvec![Action::Execute(cp_to_char(cp))], State::Ground)),
        0x1b => Some((smallvec::smallvec![Action::Clear], State::Escape)),
        0x80..=0x8f | 0x91..=0x97 | 0x99 | 0x9a => {
            Some((smallvec::smallvec![Action::Execute(cp_to_char(cp))], State::Ground))
        }
        0x9c => Some((SmallVec::new(), State::Ground)),
        0x90 => Some((smallvec::smallvec![Action::Clear], State::DcsEntry)),
        0x9d => Some((smallvec::smallvec![Action::OscStart], State::OscString)),
        0x98 | 0x9e | 0x9f => Some((SmallVec::new(), State::SosPmApcString)),
        0x9b => Some((smallvec::smallvec![Action::Clear], State::CsiEntry)),
        _ => None,
    }
}

fn cp_to_char(cp: u32) -> char {
    char::from_u32(cp).unwrap_or('\u{fffd}')
}

/// The parser's single piece of owned state: which of the 13 states it is
/// currently in. Transition logic is a pure function of (state, input).
pub struct Parser {
    state: State,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { state: State::Ground }
    }

    pub fn is_grounded(&self) -> bool {
        self.state == State::Ground
    }

    /// Feeds one decoded code point through the state machine, returning
    /// the resulting actions in emission order.
    pub fn input(&mut self, ch: char) -> Actions {
        let cp = ch as u32;

        let (actions, next) = if let Some(hit) = anywhere(cp) {
            hit
        } else {
            self.transition(cp, ch)
        };

        if next != self.state {
            let mut out = Actions::new();
            out.extend(self.exit_actions(self.state));
            out.extend(actions);
            out.extend(self.enter_actions(next));
            self.state = next;
            out
        } else {
            self.state = next;
            actions
        }
    }

    fn exit_actions(&self, from: State) -> Actions {
        match from {
            State::DcsPassthrough => smallvec::smallvec![Action::Unhook],
            State::OscString => smallvec::smallvec![Action::OscEnd],
            _ => SmallVec::new(),
        }
    }

    fn enter_actions(&self, to: State) -> Actions {
        match to {
            State::DcsPassthrough => smallvec::smallvec![Action::Hook],
            _ => SmallVec::new(),
        }
    }

    fn transition(&self, cp: u32, ch: char) -> (Actions, State) {
        use Action::*;
        use State::*;

        let one = |a: Action, s: State| (smallvec::smallvec![a], s);
        let none = |s: State| (SmallVec::new(), s);

        match self.state {
            Ground => match cp {
                _ if is_c0(cp) => one(Execute(ch), Ground),
                0x20..=0x7e => one(Print(ch), Ground),
                0x7f => none(Ground),
                _ if cp >= 0xa0 => one(Print(ch), Ground),
                _ => none(Ground),
            },
            Escape => match cp {
                _ if is_c0(cp) => one(Execute(ch), Escape),
                0x7f => none(Escape),
                0x20..=0x2f => one(Collect(ch), EscapeIntermediate),
                0x50 => one(Clear, DcsEntry),
                0x58 | 0x5e | 0x5f => none(SosPmApcString),
                0x5b => one(Clear, CsiEntry),
                0x5d => one(OscStart, OscString),
                0x30..=0x4f | 0x51..=0x57 | 0x59 | 0x5a | 0x5c | 0x60..=0x7e => {
                    one(EscDispatch(ch), Ground)
                }
                _ => none(Ground),
            },
            EscapeIntermediate => match cp {
                _ if is_c0(cp) => one(Execute(ch), EscapeIntermediate),
                0x20..=0x2f => one(Collect(ch), EscapeIntermediate),
                0x7f => none(EscapeIntermediate),
                0x30..=0x7e => one(EscDispatch(ch), Ground),
                _ => none(Ground),
            },
            CsiEntry => match cp {
                _ if is_c0(cp) => one(Execute(ch), CsiEntry),
                0x7f => none(CsiEntry),
                0x20..=0x2f => one(Collect(ch), CsiIntermediate),
                0x3a => none(CsiIgnore),
                0x30..=0x39 | 0x3b => one(Param(ch), CsiParam),
                0x3c..=0x3f => one(Collect(ch), CsiParam),
                0x40..=0x7e => one(CsiDispatch(ch), Ground),
                _ => none(CsiIgnore),
            },
            CsiParam => match cp {
                _ if is_c0(cp) => one(Execute(ch), CsiParam),
                0x30..=0x39 | 0x3b => one(Param(ch), CsiParam),
                0x7f => none(CsiParam),
                0x3a | 0x3c..=0x3f => none(CsiIgnore),
                0x20..=0x2f => one(Collect(ch), CsiIntermediate),
                0x40..=0x7e => one(CsiDispatch(ch), Ground),
                _ => none(CsiIgnore),
            },
            CsiIntermediate => match cp {
                _ if is_c0(cp) => one(Execute(ch), CsiIntermediate),
                0x20..=0x2f => one(Collect(ch), CsiIntermediate),
                0x7f => none(CsiIntermediate),
                0x30..=0x3f => none(CsiIgnore),
                0x40..=0x7e => one(CsiDispatch(ch), Ground),
                _ => none(CsiIgnore),
            },
            CsiIgnore => match cp {
                _ if is_c0(cp) => one(Execute(ch), CsiIgnore),
                0x20..=0x3f | 0x7f => none(CsiIgnore),
                0x40..=0x7e => none(Ground),
                _ => none(CsiIgnore),
            },
            DcsEntry => match cp {
                _ if is_c0(cp) => none(DcsEntry),
                0x7f => none(DcsEntry),
                0x20..=0x2f => one(Collect(ch), DcsIntermediate),
                0x3a => none(DcsIgnore),
                0x30..=0x39 | 0x3b => one(Param(ch), DcsParam),
                0x3c..=0x3f => one(Collect(ch), DcsParam),
                0x40..=0x7e => none(DcsPassthrough),
                _ => none(DcsIgnore),
            },
            DcsParam => match cp {
                _ if is_c0(cp) => none(DcsParam),
                0x30..=0x39 | 0x3b => one(Param(ch), DcsParam),
                0x7f => none(DcsParam),
                0x3a | 0x3c..=0x3f => none(DcsIgnore),
                0x20..=0x2f => one(Collect(ch), DcsIntermediate),
                0x40..=0x7e => none(DcsPassthrough),
                _ => none(DcsIgnore),
            },
            DcsIntermediate => match cp {
                _ if is_c0(cp) => none(DcsIntermediate),
                0x20..=0x2f => one(Collect(ch), DcsIntermediate),
                0x7f => none(DcsIntermediate),
                0x30..=0x3f => none(DcsIgnore),
                0x40..=0x7e => none(DcsPassthrough),
                _ => none(DcsIgnore),
            },
            DcsPassthrough => match cp {
                _ if is_c0(cp) => one(Put(ch), DcsPassthrough),
                0x20..=0x7e => one(Put(ch), DcsPassthrough),
                0x7f => none(DcsPassthrough),
                _ if cp >= 0xa0 => one(Put(ch), DcsPassthrough),
                _ => none(DcsPassthrough),
            },
            DcsIgnore => none(DcsIgnore),
            OscString => match cp {
                // xterm extension: BEL also terminates an OSC string, used
                // by window/icon-title sequences that never send ST.
                0x07 => none(Ground),
                _ if is_c0(cp) => none(OscString),
                0x20..=0x7e => one(OscPut(ch), OscString),
                0x7f => none(OscString),
                _ if cp >= 0xa0 => one(OscPut(ch), OscString),
                _ => none(OscString),
            },
            SosPmApcString => none(SosPmApcString),
        }
    }
}

/// Decodes a byte stream into complete Unicode scalar values, following
/// Unicode 6.0 §3.9 "best practice" recovery: on an invalid sequence, emit
/// one U+FFFD and resume scanning from the offending byte. Overlong,
/// surrogate, and out-of-range decodes likewise become U+FFFD.
#[derive(Default)]
pub struct Utf8Decoder {
    pending: SmallVec<[u8; 4]>,
    needed: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one input byte. Returns zero or one decoded character; a
    /// continuation byte that completes a sequence yields `Some`, a
    /// continuation byte that is itself invalid yields `Some('\u{fffd}')`
    /// (and is then re-driven as a fresh lead byte by the caller per the
    /// Unicode recovery rule below), and a byte that starts a sequence but
    /// needs more continuations yields `None`.
    pub fn push(&mut self, byte: u8) -> SmallVec<[char; 2]> {
        let mut out = SmallVec::new();

        if self.needed == 0 {
            if byte < 0x80 {
                out.push(byte as char);
            } else if (0xc2..=0xdf).contains(&byte) {
                self.pending = smallvec::smallvec![byte];
                self.needed = 1;
            } else if (0xe0..=0xef).contains(&byte) {
                self.pending = smallvec::smallvec![byte];
                self.needed = 2;
            } else if (0xf0..=0xf4).contains(&byte) {
                self.pending = smallvec::smallvec![byte];
                self.needed = 3;
            } else {
                out.push('\u{fffd}');
            }
            return out;
        }

        if (0x80..=0xbf).contains(&byte) {
            self.pending.push(byte);
            self.needed -= 1;
            if self.needed == 0 {
                let bytes = std::mem::take(&mut self.pending);
                match std::str::from_utf8(&bytes) {
                    Ok(s) => out.push(s.chars().next().unwrap_or('\u{fffd}')),
                    Err(_) => out.push('\u{fffd}'),
                }
            }
            out
        } else {
            // Invalid continuation: abandon the pending sequence, emit
            // replacement, and re-drive this byte as a fresh lead byte.
            self.pending.clear();
            self.needed = 0;
            out.push('\u{fffd}');
            out.extend(self.push(byte));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_prints_ascii() {
        let mut p = Parser::new();
        let actions = p.input('a');
        assert_eq!(&actions[..], &[Action::Print('a')]);
    }

    #[test]
    fn csi_dispatch_sequence() {
        let mut p = Parser::new();
        for ch in "\u{1b}[1;2H".chars() {
            p.input(ch);
        }
        assert!(p.is_grounded());
    }

    #[test]
    fn csi_dispatch_emits_on_final_byte() {
        let mut p = Parser::new();
        p.input('\u{1b}');
        p.input('[');
        p.input('3');
        p.input(';');
        p.input('4');
        let actions = p.input('H');
        assert!(actions.contains(&Action::CsiDispatch('H')));
        assert!(p.is_grounded());
    }

    #[test]
    fn osc_string_emits_start_put_end() {
        let mut p = Parser::new();
        assert!(p.input('\u{1b}').contains(&Action::Clear));
        assert!(p.input(']').contains(&Action::OscStart));
        assert!(p.input('0').contains(&Action::OscPut('0')));
        assert!(p.input(';').contains(&Action::OscPut(';')));
        let actions = p.input('\u{7}');
        assert!(actions.contains(&Action::OscEnd));
        assert!(p.is_grounded());
    }

    #[test]
    fn can_aborts_escape_sequence() {
        let mut p = Parser::new();
        p.input('\u{1b}');
        let actions = p.input('\u{18}');
        assert!(actions.iter().any(|a| matches!(a, Action::Execute('\u{18}'))));
        assert!(p.is_grounded());
    }

    #[test]
    fn utf8_decoder_round_trips_multibyte() {
        let mut dec = Utf8Decoder::new();
        let mut got = Vec::new();
        for b in "héllo".bytes() {
            got.extend(dec.push(b));
        }
        assert_eq!(got.into_iter().collect::<String>(), "héllo");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_lead_byte() {
        let mut dec = Utf8Decoder::new();
        let got = dec.push(0xff);
        assert_eq!(&got[..], &['\u{fffd}']);
    }

    #[test]
    fn utf8_decoder_replaces_truncated_sequence() {
        let mut dec = Utf8Decoder::new();
        assert!(dec.push(0xe2).is_empty());
        let got = dec.push(b'a');
        assert_eq!(&got[..], &['\u{fffd}', 'a']);
    }
}
