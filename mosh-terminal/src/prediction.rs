//! Local echo prediction: tentatively draws keystrokes on the framebuffer
//! before the round trip confirming them comes back, so typing feels
//! instant over a high-latency link. Predictions are versioned by epoch so
//! a confirmed batch can be told apart from one still in flight, and culled
//! the moment the real terminal state disagrees with them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::cell::Cell;
use crate::emulator::char_width;
use crate::framebuffer::Framebuffer;
use crate::parser::{Action, Parser as AnsiParser, Utf8Decoder};

const SRTT_TRIGGER_LOW: Duration = Duration::from_millis(20);
const SRTT_TRIGGER_HIGH: Duration = Duration::from_millis(30);
const FLAG_TRIGGER_LOW: Duration = Duration::from_millis(50);
const FLAG_TRIGGER_HIGH: Duration = Duration::from_millis(80);
const GLITCH_THRESHOLD: Duration = Duration::from_millis(250);
const GLITCH_FLAG_THRESHOLD: Duration = Duration::from_millis(5000);
const GLITCH_REPAIR_COUNT: i32 = 10;
const GLITCH_REPAIR_MININTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validity {
    Pending,
    Correct,
    CorrectNoCredit,
    IncorrectOrExpired,
    Inactive,
}

/// Fields shared by every kind of conditional overlay: when the underlying
/// local-frame number it depends on expires, which prediction epoch it
/// belongs to, and whether it's live at all.
#[derive(Debug, Clone)]
struct OverlayBase {
    expiration_frame: u64,
    col: usize,
    active: bool,
    tentative_until_epoch: u64,
    prediction_time: Option<Instant>,
}

impl OverlayBase {
    fn new(expiration_frame: u64, col: usize, tentative_until_epoch: u64) -> Self {
        Self {
            expiration_frame,
            col,
            active: false,
            tentative_until_epoch,
            prediction_time: None,
        }
    }

    fn tentative(&self, confirmed_epoch: u64) -> bool {
        self.tentative_until_epoch > confirmed_epoch
    }

    fn reset(&mut self) {
        self.expiration_frame = u64::MAX;
        self.tentative_until_epoch = u64::MAX;
        self.active = false;
    }

    fn expire(&mut self, expiration_frame: u64, now: Instant) {
        self.expiration_frame = expiration_frame;
        self.prediction_time = Some(now);
    }
}

#[derive(Debug, Clone)]
struct ConditionalCursorMove {
    base: OverlayBase,
    row: usize,
}

impl ConditionalCursorMove {
    fn get_validity(&self, fb: &Framebuffer, late_ack: u64) -> Validity {
        if !self.base.active {
            return Validity::Inactive;
        }
        if self.row >= fb.height() || self.base.col >= fb.width() {
            return Validity::IncorrectOrExpired;
        }
        if late_ack >= self.base.expiration_frame {
            if fb.ds.cursor_row == self.row && fb.ds.cursor_col == self.base.col {
                Validity::Correct
            } else {
                Validity::IncorrectOrExpired
            }
        } else {
            Validity::Pending
        }
    }

    fn apply(&self, fb: &mut Framebuffer, confirmed_epoch: u64) {
        if !self.base.active || self.base.tentative(confirmed_epoch) {
            return;
        }
        fb.ds.move_row(self.row as i64, false);
        fb.ds.move_col(self.base.col as i64, false, false);
    }
}

#[derive(Debug, Clone)]
struct ConditionalOverlayCell {
    base: OverlayBase,
    replacement: Cell,
    unknown: bool,
    original_contents: Vec<Cell>,
}

impl ConditionalOverlayCell {
    fn get_validity(&self, fb: &Framebuffer, row: usize, late_ack: u64) -> Validity {
        if !self.base.active {
            return Validity::Inactive;
        }
        if row >= fb.height() || self.base.col >= fb.width() {
            return Validity::IncorrectOrExpired;
        }
        if late_ack < self.base.expiration_frame {
            return Validity::Pending;
        }

        if self.unknown {
            return Validity::CorrectNoCredit;
        }
        if self.replacement.is_blank() {
            return Validity::CorrectNoCredit;
        }

        let current = fb.row(row).cell(self.base.col);
        if current.content_eq(&self.replacement) {
            if self.original_contents.iter().any(|c| c.content_eq(&self.replacement)) {
                Validity::CorrectNoCredit
            } else {
                Validity::Correct
            }
        } else {
            Validity::IncorrectOrExpired
        }
    }

    fn apply(&self, fb: &mut Framebuffer, confirmed_epoch: u64, row: usize, flag: bool) {
        if !self.base.active || row >= fb.height() || self.base.col >= fb.width() {
            return;
        }
        if self.base.tentative(confirmed_epoch) {
            return;
        }

        let mut flag = flag;
        if self.replacement.is_blank() && fb.row(row).cell(self.base.col).is_blank() {
            flag = false;
        }

        if self.unknown {
            if flag && self.base.col != fb.width() - 1 {
                fb.row_mut(row).cell_mut(self.base.col).renditions.underlined = true;
            }
            return;
        }

        if fb.row(row).cell(self.base.col) != &self.replacement {
            *fb.row_mut(row).cell_mut(self.base.col) = self.replacement.clone();
            if flag {
                fb.row_mut(row).cell_mut(self.base.col).renditions.underlined = true;
            }
        }
    }

    fn reset(&mut self) {
        self.unknown = false;
        self.original_contents.clear();
        self.base.reset();
    }

    /// Resets the cell back to inactive but, unless it was never predicted
    /// or its replacement is unknown, remembers the glyph it had just
    /// settled on as one more "don't give credit for this" original.
    fn reset_with_orig(&mut self) {
        if !self.base.active || self.unknown {
            self.reset();
            return;
        }
        let mut new_orig = self.original_contents.clone();
        new_orig.push(self.replacement.clone());
        self.reset();
        self.original_contents = new_orig;
    }
}

#[derive(Debug, Clone)]
struct ConditionalOverlayRow {
    row_num: usize,
    cells: Vec<ConditionalOverlayCell>,
}

/// When and how readily predictions should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPreference {
    Always,
    Never,
    Adaptive,
    Experimental,
}

pub struct PredictionEngine {
    last_char: Option<char>,
    decoder: Utf8Decoder,
    parser: AnsiParser,

    overlays: VecDeque<ConditionalOverlayRow>,
    cursors: VecDeque<ConditionalCursorMove>,

    local_frame_sent: u64,
    local_frame_acked: u64,
    local_frame_late_acked: u64,

    prediction_epoch: u64,
    confirmed_epoch: u64,

    flagging: bool,
    srtt_trigger: bool,
    glitch_trigger: i32,
    last_quick_confirmation: Option<Instant>,

    last_height: usize,
    last_width: usize,

    send_interval: Duration,
    display_preference: DisplayPreference,
}

impl Default for PredictionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionEngine {
    pub fn new() -> Self {
        Self {
            last_char: None,
            decoder: Utf8Decoder::default(),
            parser: AnsiParser::default(),
            overlays: VecDeque::new(),
            cursors: VecDeque::new(),
            local_frame_sent: 0,
            local_frame_acked: 0,
            local_frame_late_acked: 0,
            prediction_epoch: 1,
            confirmed_epoch: 0,
            flagging: false,
            srtt_trigger: false,
            glitch_trigger: 0,
            last_quick_confirmation: None,
            last_height: 0,
            last_width: 0,
            send_interval: Duration::from_millis(250),
            display_preference: DisplayPreference::Adaptive,
        }
    }

    pub fn set_display_preference(&mut self, pref: DisplayPreference) {
        self.display_preference = pref;
    }

    pub fn set_local_frame_sent(&mut self, n: u64) {
        self.local_frame_sent = n;
    }

    pub fn set_local_frame_acked(&mut self, n: u64) {
        self.local_frame_acked = n;
    }

    pub fn set_local_frame_late_acked(&mut self, n: u64) {
        self.local_frame_late_acked = n;
    }

    pub fn set_send_interval(&mut self, interval: Duration) {
        self.send_interval = interval;
    }

    /// Whether any prediction is currently tracked, live or tentative --
    /// distinct from whether predictions are currently being *drawn*.
    pub fn active(&self) -> bool {
        if !self.cursors.is_empty() {
            return true;
        }
        self.overlays.iter().any(|row| row.cells.iter().any(|c| c.base.active))
    }

    pub fn reset(&mut self) {
        self.cursors.clear();
        self.overlays.clear();
        self.become_tentative();
    }

    fn become_tentative(&mut self) {
        if self.display_preference != DisplayPreference::Experimental {
            self.prediction_epoch += 1;
        }
    }

    fn init_cursor(&mut self, fb: &Framebuffer) {
        if self.cursors.is_empty() {
            let mut base = OverlayBase::new(self.local_frame_sent + 1, fb.ds.cursor_col, self.prediction_epoch);
            base.active = true;
            self.cursors.push_back(ConditionalCursorMove { base, row: fb.ds.cursor_row });
            return;
        }
        let needs_new = self.cursors.back().unwrap().base.tentative_until_epoch != self.prediction_epoch;
        if needs_new {
            let (row, col) = {
                let c = self.cursors.back().unwrap();
                (c.row, c.base.col)
            };
            let mut base = OverlayBase::new(self.local_frame_sent + 1, col, self.prediction_epoch);
            base.active = true;
            self.cursors.push_back(ConditionalCursorMove { base, row });
        }
    }

    fn kill_epoch(&mut self, epoch: u64, fb: &Framebuffer) {
        let cutoff = epoch.saturating_sub(1);
        self.cursors.retain(|c| !c.base.tentative(cutoff));

        let mut base = OverlayBase::new(self.local_frame_sent + 1, fb.ds.cursor_col, self.prediction_epoch);
        base.active = true;
        self.cursors.push_back(ConditionalCursorMove { base, row: fb.ds.cursor_row });

        for row in self.overlays.iter_mut() {
            for cell in row.cells.iter_mut() {
                if cell.base.tentative(cutoff) {
                    cell.reset();
                }
            }
        }

        self.become_tentative();
    }

    fn get_or_make_row(&mut self, row_num: usize, num_cols: usize) -> usize {
        if let Some(pos) = self.overlays.iter().position(|r| r.row_num == row_num) {
            return pos;
        }
        let cells = (0..num_cols)
            .map(|i| ConditionalOverlayCell {
                base: OverlayBase::new(0, i, self.prediction_epoch),
                replacement: Cell::blank(),
                unknown: false,
                original_contents: Vec::new(),
            })
            .collect();
        self.overlays.push_back(ConditionalOverlayRow { row_num, cells });
        self.overlays.len() - 1
    }

    /// Feeds one byte of what the user just typed (or will send to the
    /// host) through a private copy of the VT parser, so the engine can
    /// guess how the remote terminal will react before its echo arrives.
    pub fn new_user_byte(&mut self, byte: u8, fb: &Framebuffer, now: Instant) {
        if self.display_preference == DisplayPreference::Never {
            return;
        } else if self.display_preference == DisplayPreference::Experimental {
            self.prediction_epoch = self.confirmed_epoch;
        }

        self.cull(fb, now);

        let chars: Vec<char> = self.decoder.push(byte).into_iter().collect();
        for ch in chars {
            self.apply_user_char(ch, fb, now);
        }
    }

    fn apply_user_char(&mut self, ch: char, fb: &Framebuffer, now: Instant) {
        let mut ch = ch;
        if self.last_char == Some('\u{1b}') && ch == 'O' {
            ch = '[';
        }
        self.last_char = Some(ch);

        let actions = self.parser.input(ch);
        for action in actions {
            match action {
                Action::Print(pch) => self.handle_print(pch, fb, now),
                Action::Execute(ech) => {
                    self.become_tentative();
                    if ech == '\r' {
                        self.newline_carriage_return(fb, now);
                    }
                }
                Action::EscDispatch(_) => self.become_tentative(),
                Action::CsiDispatch('C') => {
                    self.init_cursor(fb);
                    if let Some(c) = self.cursors.back_mut() {
                        if c.base.col + 1 < fb.width() {
                            c.base.col += 1;
                            c.base.expire(self.local_frame_sent + 1, now);
                        }
                    }
                }
                Action::CsiDispatch('D') => {
                    self.init_cursor(fb);
                    if let Some(c) = self.cursors.back_mut() {
                        if c.base.col > 0 {
                            c.base.col -= 1;
                            c.base.expire(self.local_frame_sent + 1, now);
                        }
                    }
                }
                Action::CsiDispatch(_) => self.become_tentative(),
                _ => {}
            }
        }
    }

    fn handle_print(&mut self, ch: char, fb: &Framebuffer, now: Instant) {
        self.init_cursor(fb);

        if ch == '\u{7f}' {
            self.predict_backspace(fb, now);
            return;
        }

        if (ch as u32) < 0x20 || char_width(ch) != 1 {
            self.become_tentative();
            return;
        }

        let row_num = self.cursors.back().unwrap().row;
        let col = self.cursors.back().unwrap().base.col;
        let row_idx = self.get_or_make_row(row_num, fb.width());

        if col + 1 >= fb.width() {
            self.become_tentative();
        }

        for i in (col + 1..fb.width()).rev() {
            let (unknown, replacement) = if i == fb.width() - 1 {
                (true, Cell::blank())
            } else if self.overlays[row_idx].cells[i - 1].base.active {
                let prev = &self.overlays[row_idx].cells[i - 1];
                (prev.unknown, prev.replacement.clone())
            } else {
                (false, fb.row(row_num).cell(i - 1).clone())
            };
            let orig = fb.row(row_num).cell(i).clone();
            let cell = &mut self.overlays[row_idx].cells[i];
            cell.reset_with_orig();
            cell.base.active = true;
            cell.base.tentative_until_epoch = self.prediction_epoch;
            cell.base.expire(self.local_frame_sent + 1, now);
            cell.original_contents.push(orig);
            cell.unknown = unknown;
            if !unknown {
                cell.replacement = replacement;
            }
        }

        let renditions = if col > 0 && self.overlays[row_idx].cells[col - 1].base.active && !self.overlays[row_idx].cells[col - 1].unknown {
            self.overlays[row_idx].cells[col - 1].replacement.renditions
        } else if col > 0 {
            fb.row(row_num).cell(col - 1).renditions
        } else {
            fb.ds.renditions
        };

        let orig = fb.row(row_num).cell(col).clone();
        let cell = &mut self.overlays[row_idx].cells[col];
        cell.reset_with_orig();
        cell.base.active = true;
        cell.base.tentative_until_epoch = self.prediction_epoch;
        cell.base.expire(self.local_frame_sent + 1, now);
        cell.unknown = false;
        cell.replacement = Cell::blank();
        cell.replacement.renditions = renditions;
        cell.replacement.set_character(ch);
        cell.original_contents.push(orig);

        if let Some(c) = self.cursors.back_mut() {
            c.base.expire(self.local_frame_sent + 1, now);
        }

        if col < fb.width() - 1 {
            if let Some(c) = self.cursors.back_mut() {
                c.base.col += 1;
            }
        } else {
            self.become_tentative();
            self.newline_carriage_return(fb, now);
        }
    }

    fn predict_backspace(&mut self, fb: &Framebuffer, now: Instant) {
        let row_num = self.cursors.back().unwrap().row;
        let col = self.cursors.back().unwrap().base.col;
        if col == 0 {
            return;
        }

        let row_idx = self.get_or_make_row(row_num, fb.width());
        if let Some(c) = self.cursors.back_mut() {
            c.base.col -= 1;
            c.base.expire(self.local_frame_sent + 1, now);
        }
        let new_col = self.cursors.back().unwrap().base.col;

        for i in new_col..fb.width() {
            let (unknown, replacement) = if i + 2 < fb.width() && self.overlays[row_idx].cells[i + 1].base.active {
                let next = &self.overlays[row_idx].cells[i + 1];
                (next.unknown, next.replacement.clone())
            } else if i + 2 < fb.width() {
                (false, fb.row(row_num).cell(i + 1).clone())
            } else {
                (true, Cell::blank())
            };

            let orig = fb.row(row_num).cell(i).clone();
            let cell = &mut self.overlays[row_idx].cells[i];
            cell.reset_with_orig();
            cell.base.active = true;
            cell.base.tentative_until_epoch = self.prediction_epoch;
            cell.base.expire(self.local_frame_sent + 1, now);
            cell.original_contents.push(orig);
            cell.unknown = unknown;
            if !unknown {
                cell.replacement = replacement;
            }
        }
    }

    fn newline_carriage_return(&mut self, fb: &Framebuffer, now: Instant) {
        self.init_cursor(fb);
        if let Some(c) = self.cursors.back_mut() {
            c.base.col = 0;
        }

        let (row, is_last) = {
            let c = self.cursors.back().unwrap();
            (c.row, c.row == fb.height() - 1)
        };

        if is_last {
            let row_idx = self.get_or_make_row(row, fb.width());
            for cell in self.overlays[row_idx].cells.iter_mut() {
                cell.base.active = true;
                cell.base.tentative_until_epoch = self.prediction_epoch;
                cell.base.expire(self.local_frame_sent + 1, now);
                cell.replacement = Cell::blank();
                cell.unknown = false;
            }
        } else if let Some(c) = self.cursors.back_mut() {
            c.row += 1;
        }
    }

    /// Drops predictions the real terminal state has confirmed or
    /// contradicted, and updates the hysteresis-controlled triggers that
    /// decide whether predictions are currently worth showing at all.
    pub fn cull(&mut self, fb: &Framebuffer, now: Instant) {
        if self.display_preference == DisplayPreference::Never {
            return;
        }

        if self.last_height != fb.height() || self.last_width != fb.width() {
            self.last_height = fb.height();
            self.last_width = fb.width();
            self.reset();
        }

        if self.send_interval > SRTT_TRIGGER_HIGH {
            self.srtt_trigger = true;
        } else if self.srtt_trigger && self.send_interval <= SRTT_TRIGGER_LOW && !self.active() {
            self.srtt_trigger = false;
        }

        if self.send_interval > FLAG_TRIGGER_HIGH {
            self.flagging = true;
        } else if self.send_interval <= FLAG_TRIGGER_LOW {
            self.flagging = false;
        }

        if self.glitch_trigger > GLITCH_REPAIR_COUNT {
            self.flagging = true;
        }

        let mut kill_epochs = Vec::new();
        let mut rows_to_drop = Vec::new();

        for row_idx in 0..self.overlays.len() {
            let row_num = self.overlays[row_idx].row_num;
            if row_num >= fb.height() {
                rows_to_drop.push(row_idx);
                continue;
            }

            for cell_idx in 0..self.overlays[row_idx].cells.len() {
                let validity = self.overlays[row_idx].cells[cell_idx].get_validity(fb, row_num, self.local_frame_late_acked);
                match validity {
                    Validity::IncorrectOrExpired => {
                        let tentative = self.overlays[row_idx].cells[cell_idx].base.tentative(self.confirmed_epoch);
                        if self.display_preference == DisplayPreference::Experimental {
                            self.overlays[row_idx].cells[cell_idx].reset();
                        } else if tentative {
                            kill_epochs.push(self.overlays[row_idx].cells[cell_idx].base.tentative_until_epoch);
                        } else {
                            self.reset();
                            return;
                        }
                    }
                    Validity::Correct => {
                        let tentative_until = self.overlays[row_idx].cells[cell_idx].base.tentative_until_epoch;
                        if tentative_until > self.confirmed_epoch {
                            self.confirmed_epoch = tentative_until;
                        }
                        if let Some(pt) = self.overlays[row_idx].cells[cell_idx].base.prediction_time {
                            let repairable = self.glitch_trigger > 0
                                && now.duration_since(pt) < GLITCH_THRESHOLD
                                && self
                                    .last_quick_confirmation
                                    .map(|t| now.saturating_duration_since(t) >= GLITCH_REPAIR_MININTERVAL)
                                    .unwrap_or(true);
                            if repairable {
                                self.glitch_trigger -= 1;
                                self.last_quick_confirmation = Some(now);
                            }
                        }
                        self.overlays[row_idx].cells[cell_idx].reset();
                    }
                    Validity::CorrectNoCredit => {
                        self.overlays[row_idx].cells[cell_idx].reset();
                    }
                    Validity::Pending => {
                        if let Some(pt) = self.overlays[row_idx].cells[cell_idx].base.prediction_time {
                            let elapsed = now.duration_since(pt);
                            if elapsed >= GLITCH_FLAG_THRESHOLD {
                                self.glitch_trigger = GLITCH_REPAIR_COUNT * 2;
                            } else if elapsed >= GLITCH_THRESHOLD && self.glitch_trigger < GLITCH_REPAIR_COUNT {
                                self.glitch_trigger = GLITCH_REPAIR_COUNT;
                            }
                        }
                    }
                    Validity::Inactive => {}
                }
            }
        }

        for &idx in rows_to_drop.iter().rev() {
            self.overlays.remove(idx);
        }

        for epoch in kill_epochs {
            self.kill_epoch(epoch, fb);
        }

        if let Some(c) = self.cursors.back() {
            if c.get_validity(fb, self.local_frame_late_acked) == Validity::IncorrectOrExpired {
                if self.display_preference == DisplayPreference::Experimental {
                    self.cursors.clear();
                } else {
                    self.reset();
                    return;
                }
            }
        }

        self.cursors.retain(|c| c.get_validity(fb, self.local_frame_late_acked) == Validity::Pending);
    }

    pub fn apply(&self, fb: &mut Framebuffer) {
        let show = self.display_preference != DisplayPreference::Never
            && (self.srtt_trigger
                || self.glitch_trigger > 0
                || self.display_preference == DisplayPreference::Always
                || self.display_preference == DisplayPreference::Experimental);

        if !show {
            return;
        }

        for cursor in &self.cursors {
            cursor.apply(fb, self.confirmed_epoch);
        }
        for row in &self.overlays {
            for cell in &row.cells {
                cell.apply(fb, self.confirmed_epoch, row.row_num, self.flagging);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn typed_character_predicts_immediately() {
        let mut engine = PredictionEngine::new();
        engine.set_display_preference(DisplayPreference::Always);
        let fb = Framebuffer::new(10, 3);

        engine.new_user_byte(b'x', &fb, now());

        let mut shown = fb.clone();
        engine.apply(&mut shown);
        assert_eq!(shown.row(0).cell(0).contents(), &['x']);
    }

    #[test]
    fn confirmed_prediction_is_culled() {
        let mut engine = PredictionEngine::new();
        engine.set_display_preference(DisplayPreference::Always);
        let mut fb = Framebuffer::new(10, 3);

        engine.new_user_byte(b'x', &fb, now());
        engine.set_local_frame_late_acked(engine.local_frame_sent + 1);

        fb.row_mut(0).cell_mut(0).set_character('x');
        engine.cull(&fb, now());

        assert!(!engine.active());
    }

    #[test]
    fn never_preference_never_predicts() {
        let mut engine = PredictionEngine::new();
        engine.set_display_preference(DisplayPreference::Never);
        let fb = Framebuffer::new(10, 3);

        engine.new_user_byte(b'x', &fb, now());
        assert!(!engine.active());
    }

    #[test]
    fn backspace_shifts_predictions_left() {
        let mut engine = PredictionEngine::new();
        engine.set_display_preference(DisplayPreference::Always);
        let fb = Framebuffer::new(10, 3);

        engine.new_user_byte(b'a', &fb, now());
        engine.new_user_byte(b'b', &fb, now());
        engine.new_user_byte(0x7f, &fb, now());

        let mut shown = fb.clone();
        engine.apply(&mut shown);
        assert_eq!(shown.row(0).cell(0).contents(), &['a']);
    }
}
