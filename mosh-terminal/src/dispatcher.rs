//! Parameter accumulation for CSI/DCS sequences. Dispatch itself is a match
//! statement in [`crate::emulator`]; this module only owns the raw
//! parameter/intermediate-byte accumulation feeding into it.

/// CSI/DCS parameters are capped at this many raw characters; beyond that
/// the sequence is still consumed but extra digits are dropped.
const MAX_PARAM_CHARS: usize = 100;

/// A single parameter value is clamped to this magnitude to keep absurd
/// input from producing an absurd cursor move or scroll.
pub const PARAM_MAX: i64 = 16383;

/// At most this many intermediate bytes are retained (`?`, `!`, `#`, `>`,
/// …) -- every function in the required set needs at most one.
const MAX_COLLECTED: usize = 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatcher {
    params_buf: String,
    collected: String,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.params_buf.clear();
        self.collected.clear();
    }

    pub fn collect(&mut self, ch: char) {
        if self.collected.len() < MAX_COLLECTED {
            self.collected.push(ch);
        }
    }

    pub fn param(&mut self, ch: char) {
        if self.params_buf.len() < MAX_PARAM_CHARS {
            self.params_buf.push(ch);
        }
    }

    pub fn collected(&self) -> &str {
        &self.collected
    }

    fn params(&self) -> Vec<Option<i64>> {
        if self.params_buf.is_empty() {
            return Vec::new();
        }
        self.params_buf
            .split(';')
            .map(|s| {
                if s.is_empty() {
                    None
                } else {
                    s.parse::<i64>().ok().map(|v| v.clamp(-PARAM_MAX, PARAM_MAX))
                }
            })
            .collect()
    }

    pub fn param_count(&self) -> usize {
        self.params().len()
    }

    /// Substitutes `default` for a missing or non-positive parameter.
    pub fn getparam(&self, n: usize, default: i64) -> i64 {
        self.params()
            .get(n)
            .copied()
            .flatten()
            .filter(|&v| v > 0)
            .unwrap_or(default)
    }

    /// Raw (unsubstituted) parameter list, used by `SGR` which must treat
    /// every listed code including an explicit `0`.
    pub fn raw_params(&self) -> Vec<i64> {
        self.params().into_iter().map(|p| p.unwrap_or(0)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_nonpositive_params_substitute_default() {
        let mut d = Dispatcher::new();
        assert_eq!(d.getparam(0, 1), 1);
        for ch in "0".chars() {
            d.param(ch);
        }
        assert_eq!(d.getparam(0, 1), 1);
    }

    #[test]
    fn positive_param_is_used() {
        let mut d = Dispatcher::new();
        for ch in "5;7".chars() {
            d.param(ch);
        }
        assert_eq!(d.getparam(0, 1), 5);
        assert_eq!(d.getparam(1, 1), 7);
        assert_eq!(d.getparam(2, 9), 9);
    }
}
