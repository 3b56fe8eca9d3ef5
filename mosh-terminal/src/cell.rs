use smallvec::SmallVec;

/// A cell holds at most one base code point plus a handful of combining
/// marks. 16 matches the original's `MAX_COMBINING_CHAR_PER_CELL + 1`.
const MAX_CONTENTS: usize = 16;

/// SGR-selectable colors. Only the basic/bright palette and the default
/// sentinel are modeled; 256-color and truecolor SGR extensions are out of
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Palette(u8),
}

/// The rendition (graphic attributes) applied to a cell, set by `SGR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Renditions {
    pub bold: bool,
    pub italic: bool,
    pub underlined: bool,
    pub blink: bool,
    pub inverse: bool,
    pub invisible: bool,
    pub fg: Color,
    pub bg: Color,
}

impl Renditions {
    /// Applies one SGR parameter. Unknown codes are silently ignored, as in
    /// the original (many clients send codes a minimal VT220 never defined).
    pub fn sgr(&mut self, code: i64) {
        match code {
            0 => *self = Renditions::default(),
            1 => self.bold = true,
            22 => self.bold = false,
            4 => self.underlined = true,
            24 => self.underlined = false,
            5 => self.blink = true,
            25 => self.blink = false,
            7 => self.inverse = true,
            27 => self.inverse = false,
            8 => self.invisible = true,
            28 => self.invisible = false,
            3 => self.italic = true,
            23 => self.italic = false,
            30..=37 => self.fg = Color::Palette((code - 30) as u8),
            39 => self.fg = Color::Default,
            40..=47 => self.bg = Color::Palette((code - 40) as u8),
            49 => self.bg = Color::Default,
            90..=97 => self.fg = Color::Palette((code - 90 + 8) as u8),
            100..=107 => self.bg = Color::Palette((code - 100 + 8) as u8),
            _ => {}
        }
    }

    /// Sets one or more renditions from an already-parsed SGR parameter
    /// list. An empty list (bare `ESC [ m`) resets to the default rendition.
    pub fn set_rendition(&mut self, params: &[i64]) {
        if params.is_empty() {
            *self = Renditions::default();
            return;
        }
        for &p in params {
            self.sgr(p);
        }
    }

    /// Renders this rendition back into an SGR escape, always leading with
    /// an explicit reset so the receiving terminal never inherits stray
    /// attributes from whatever it was showing before.
    pub fn to_sgr_escape(&self) -> String {
        let mut params = vec![0i64];
        if self.bold {
            params.push(1);
        }
        if self.italic {
            params.push(3);
        }
        if self.underlined {
            params.push(4);
        }
        if self.blink {
            params.push(5);
        }
        if self.inverse {
            params.push(7);
        }
        if self.invisible {
            params.push(8);
        }
        match self.fg {
            Color::Default => {}
            Color::Palette(c) if c < 8 => params.push(30 + c as i64),
            Color::Palette(c) => params.push(90 + (c - 8) as i64),
        }
        match self.bg {
            Color::Default => {}
            Color::Palette(c) if c < 8 => params.push(40 + c as i64),
            Color::Palette(c) => params.push(100 + (c - 8) as i64),
        }
        let joined = params.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(";");
        format!("\x1b[{joined}m")
    }
}

/// One screen cell. Holds up to [`MAX_CONTENTS`] code points (one base plus
/// combining marks), a double-width flag, a fallback marker for combining
/// marks attached to NBSP, a wrap marker, and the active rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    contents: SmallVec<[char; MAX_CONTENTS]>,
    pub wide: bool,
    pub fallback: bool,
    pub wrap: bool,
    pub renditions: Renditions,
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank()
    }
}

impl Cell {
    pub fn blank() -> Self {
        Self {
            contents: SmallVec::new(),
            wide: false,
            fallback: false,
            wrap: false,
            renditions: Renditions::default(),
        }
    }

    /// Resets contents and wrap/wide/fallback flags but preserves the
    /// background rendition: a blank cell still carries the current
    /// background color.
    pub fn reset(&mut self, background: Renditions) {
        self.contents.clear();
        self.wide = false;
        self.fallback = false;
        self.wrap = false;
        self.renditions = background;
    }

    pub fn contents(&self) -> &[char] {
        &self.contents
    }

    pub fn is_blank(&self) -> bool {
        self.contents.is_empty() || self.contents[0] == ' '
    }

    pub fn set_character(&mut self, ch: char) {
        self.contents.clear();
        self.contents.push(ch);
    }

    pub fn push_combining(&mut self, ch: char) {
        if self.contents.len() < MAX_CONTENTS {
            self.contents.push(ch);
        }
    }

    /// Compares cell content only, ignoring rendition -- used by the
    /// differential display's scroll detector and by prediction culling,
    /// both of which key on glyphs, not color.
    pub fn content_eq(&self, other: &Cell) -> bool {
        self.contents == other.contents && self.wide == other.wide && self.wrap == other.wrap
    }
}
