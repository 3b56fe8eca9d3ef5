//! Drives parser [`Action`]s against a [`Framebuffer`]: `print` and
//! `execute` here, the individual `CSI`/`Esc` functions in
//! [`dispatch_csi`]/[`dispatch_esc`].

use crate::cell::Cell;
use crate::dispatcher::Dispatcher;
use crate::framebuffer::Framebuffer;
use crate::parser::Action;

/// Returns the terminal column width of `ch`: 0 for combining marks, 2 for
/// the common East-Asian-wide ranges, 1 otherwise. A simplified heuristic
/// standing in for a full Unicode East Asian Width table; noted in
/// DESIGN.md.
pub(crate) fn char_width(ch: char) -> u8 {
    let cp = ch as u32;
    let combining = matches!(cp,
        0x0300..=0x036f | 0x1ab0..=0x1aff | 0x1dc0..=0x1dff |
        0x20d0..=0x20ff | 0xfe20..=0xfe2f);
    if combining {
        return 0;
    }
    let wide = matches!(cp,
        0x1100..=0x115f | 0x2e80..=0xa4cf | 0xac00..=0xd7a3 |
        0xf900..=0xfaff | 0xff00..=0xff60 | 0xffe0..=0xffe6 |
        0x20000..=0x3fffd);
    if wide {
        2
    } else {
        1
    }
}

/// Wraps a [`Framebuffer`] with the control-function and escape/CSI
/// dispatch logic that interprets parser actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emulator {
    fb: Framebuffer,
    dispatcher: Dispatcher,
    osc_active: bool,
    osc_buffer: String,
    to_host: Vec<u8>,
}

impl Emulator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            fb: Framebuffer::new(width, height),
            dispatcher: Dispatcher::new(),
            osc_active: false,
            osc_buffer: String::new(),
            to_host: Vec::new(),
        }
    }

    pub fn fb(&self) -> &Framebuffer {
        &self.fb
    }

    pub fn fb_mut(&mut self) -> &mut Framebuffer {
        &mut self.fb
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.fb.resize(width, height);
    }

    /// Drains bytes the emulator wants echoed back to the host (DSR/DA
    /// replies), matching `read_octets_to_host`.
    pub fn take_to_host(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.to_host)
    }

    fn reply(&mut self, s: &str) {
        self.to_host.extend_from_slice(s.as_bytes());
    }

    pub fn act(&mut self, action: &Action) {
        match action {
            Action::Ignore => {}
            Action::Print(ch) => self.print(*ch),
            Action::Execute(ch) => self.execute(*ch),
            Action::Clear => self.dispatcher.clear(),
            Action::Collect(ch) => self.dispatcher.collect(*ch),
            Action::Param(ch) => self.dispatcher.param(*ch),
            Action::EscDispatch(ch) => self.dispatch_esc(*ch),
            Action::CsiDispatch(ch) => self.dispatch_csi(*ch),
            Action::Hook | Action::Put(_) | Action::Unhook => {
                // No DCS function is in the required set; swallow the
                // passthrough bytes.
            }
            Action::OscStart => {
                self.osc_active = true;
                self.osc_buffer.clear();
            }
            Action::OscPut(ch) => {
                if self.osc_active {
                    self.osc_buffer.push(*ch);
                }
            }
            Action::OscEnd => {
                if self.osc_active {
                    self.osc_dispatch();
                    self.osc_active = false;
                }
            }
        }
    }

    fn print(&mut self, ch: char) {
        let width = char_width(ch);
        if width == 0 {
            let cell = self.fb.get_combining_cell();
            cell.push_combining(ch);
            return;
        }

        let ds = &self.fb.ds;
        let would_overflow = width == 2 && ds.cursor_col + 1 >= ds.width;
        if ds.next_print_will_wrap || would_overflow {
            if self.fb.ds.auto_wrap_mode {
                let (row, col) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col);
                self.fb.row_mut(row).cell_mut(col).wrap = true;
                self.fb.move_rows_autoscroll(1);
                self.fb.ds.cursor_col = 0;
            }
            self.fb.ds.next_print_will_wrap = false;
        }

        if self.fb.ds.insert_mode {
            let background = self.fb.background_renditions();
            let (row, col) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col);
            self.fb.row_mut(row).insert_cell(col, width as usize, background);
        }

        let renditions = self.fb.ds.renditions;
        let (row, col) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col);
        {
            let cell = self.fb.row_mut(row).cell_mut(col);
            cell.reset(renditions);
            cell.set_character(ch);
            cell.wide = width == 2;
        }
        if width == 2 && col + 1 < self.fb.ds.width {
            let next = self.fb.row_mut(row).cell_mut(col + 1);
            *next = Cell::blank();
            next.renditions = renditions;
        }
        self.fb.ds.new_grapheme();

        if col + (width as usize) >= self.fb.ds.width {
            self.fb.ds.next_print_will_wrap = true;
        } else {
            self.fb.ds.cursor_col = col + width as usize;
        }
    }

    fn execute(&mut self, ch: char) {
        match ch {
            '\r' => {
                self.fb.ds.cursor_col = 0;
                self.fb.ds.next_print_will_wrap = false;
            }
            '\n' | '\u{b}' | '\u{c}' => self.fb.move_rows_autoscroll(1),
            '\u{8}' => self.fb.ds.move_col(-1, true, true),
            '\t' => {
                match self.fb.ds.get_next_tab() {
                    Some(c) => self.fb.ds.cursor_col = c,
                    None => self.fb.ds.cursor_col = self.fb.ds.width - 1,
                }
                self.fb.ds.next_print_will_wrap = false;
            }
            '\u{7}' => self.fb.bell(),
            '\u{84}' => self.fb.move_rows_autoscroll(1),
            '\u{85}' => {
                self.fb.ds.cursor_col = 0;
                self.fb.move_rows_autoscroll(1);
            }
            '\u{88}' => self.fb.ds.set_tabstop(),
            '\u{8d}' => self.fb.move_rows_autoscroll(-1),
            _ => {}
        }
    }

    fn dispatch_esc(&mut self, ch: char) {
        let collected = self.dispatcher.collected().to_string();
        self.fb.ds.next_print_will_wrap = false;
        match (collected.as_str(), ch) {
            ("#", '8') => self.decaln(),
            ("", 'D') => self.fb.move_rows_autoscroll(1),
            ("", 'E') => {
                self.fb.ds.cursor_col = 0;
                self.fb.move_rows_autoscroll(1);
            }
            ("", 'H') => self.fb.ds.set_tabstop(),
            ("", 'M') => self.fb.move_rows_autoscroll(-1),
            ("", 'c') => self.fb.reset(),
            ("", '7') => self.fb.save_cursor(),
            ("", '8') => self.fb.restore_cursor(),
            _ => {}
        }
        self.dispatcher.clear();
    }

    fn decaln(&mut self) {
        let (w, h) = (self.fb.width(), self.fb.height());
        for r in 0..h {
            for c in 0..w {
                let cell = self.fb.row_mut(r).cell_mut(c);
                cell.reset(cell.renditions);
                cell.set_character('E');
            }
        }
    }

    fn dispatch_csi(&mut self, ch: char) {
        let private = self.dispatcher.collected().starts_with('?');
        let secondary = self.dispatcher.collected().starts_with('>');
        // Every CSI function cancels a pending autowrap except SGR, which
        // changes rendition without touching cursor position.
        if ch != 'm' {
            self.fb.ds.next_print_will_wrap = false;
        }
        match ch {
            'K' => self.el(),
            'J' => self.ed(),
            'A' => self.cuu(),
            'B' => self.cud(),
            'C' => self.cuf(),
            'D' => self.cub(),
            'H' | 'f' => self.cup(),
            'c' if secondary => self.reply("\u{1b}[>1;10;0c"),
            'c' => self.reply("\u{1b}[?1;2c"),
            'h' if private => self.decsm(),
            'l' if private => self.decrm(),
            'h' => self.sm(),
            'l' => self.rm(),
            'r' => self.decstbm(),
            'm' => self.sgr(),
            'n' => self.dsr(),
            'L' => self.il(),
            'M' => self.dl(),
            '@' => self.ich(),
            'P' => self.dch(),
            'd' => self.vpa(),
            'G' | '`' => self.hpa(),
            'X' => self.ech(),
            'p' if self.dispatcher.collected().starts_with('!') => self.decstr(),
            'S' => self.fb.scroll(self.dispatcher.getparam(0, 1)),
            'T' => self.fb.scroll(-self.dispatcher.getparam(0, 1)),
            'g' => self.tbc(),
            _ => {}
        }
        self.dispatcher.clear();
    }

    fn el(&mut self) {
        let mode = self.dispatcher.getparam(0, 0);
        let background = self.fb.background_renditions();
        let (row, col, width) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col, self.fb.width());
        let r = self.fb.row_mut(row);
        match mode {
            0 => {
                for c in col..width {
                    r.cell_mut(c).reset(background);
                }
            }
            1 => {
                for c in 0..=col.min(width - 1) {
                    r.cell_mut(c).reset(background);
                }
            }
            _ => {
                for c in 0..width {
                    r.cell_mut(c).reset(background);
                }
            }
        }
    }

    fn ed(&mut self) {
        let mode = self.dispatcher.getparam(0, 0);
        let background = self.fb.background_renditions();
        let (row, height, width) = (self.fb.ds.cursor_row, self.fb.height(), self.fb.width());
        match mode {
            0 => {
                self.el();
                for r in (row + 1)..height {
                    for c in 0..width {
                        self.fb.row_mut(r).cell_mut(c).reset(background);
                    }
                }
            }
            1 => {
                self.el();
                for r in 0..row {
                    for c in 0..width {
                        self.fb.row_mut(r).cell_mut(c).reset(background);
                    }
                }
            }
            _ => {
                for r in 0..height {
                    for c in 0..width {
                        self.fb.row_mut(r).cell_mut(c).reset(background);
                    }
                }
            }
        }
    }

    fn cuu(&mut self) {
        let n = self.dispatcher.getparam(0, 1);
        self.fb.ds.move_row(-n, true);
    }
    fn cud(&mut self) {
        let n = self.dispatcher.getparam(0, 1);
        self.fb.ds.move_row(n, true);
    }
    fn cuf(&mut self) {
        let n = self.dispatcher.getparam(0, 1);
        self.fb.ds.move_col(n, true, true);
    }
    fn cub(&mut self) {
        let n = self.dispatcher.getparam(0, 1);
        self.fb.ds.move_col(-n, true, true);
    }

    fn cup(&mut self) {
        let row = self.dispatcher.getparam(0, 1) - 1;
        let col = self.dispatcher.getparam(1, 1) - 1;
        self.fb.ds.move_row(row, false);
        self.fb.ds.move_col(col, false, false);
    }

    fn vpa(&mut self) {
        let row = self.dispatcher.getparam(0, 1) - 1;
        self.fb.ds.move_row(row, false);
    }

    fn hpa(&mut self) {
        let col = self.dispatcher.getparam(0, 1) - 1;
        self.fb.ds.move_col(col, false, false);
    }

    fn decsm(&mut self) {
        for p in self.dispatcher.raw_params() {
            self.set_private_mode(p, true);
        }
    }
    fn decrm(&mut self) {
        for p in self.dispatcher.raw_params() {
            self.set_private_mode(p, false);
        }
    }

    fn set_private_mode(&mut self, mode: i64, set: bool) {
        match mode {
            1 => self.fb.ds.application_mode_cursor_keys = set,
            3 => {
                self.fb.resize(if set { 132 } else { 80 }, self.fb.height());
                self.fb.reset();
            }
            5 => self.fb.ds.reverse_video = set,
            6 => {
                self.fb.ds.origin_mode = set;
                self.fb.ds.cursor_row = self.fb.ds.limit_top();
                self.fb.ds.cursor_col = 0;
            }
            7 => self.fb.ds.auto_wrap_mode = set,
            25 => self.fb.ds.cursor_visible = set,
            1000 => self.fb.ds.mouse_reporting_mode_vt100 = set,
            1002 | 1003 => self.fb.ds.mouse_reporting_mode_xterm = set,
            1004 => self.fb.ds.mouse_focus = set,
            1006 => self.fb.ds.mouse_reporting_mode_sgr = set,
            2004 => self.fb.ds.bracketed_paste = set,
            _ => {}
        }
    }

    fn sm(&mut self) {
        for p in self.dispatcher.raw_params() {
            if p == 4 {
                self.fb.ds.insert_mode = true;
            }
        }
    }
    fn rm(&mut self) {
        for p in self.dispatcher.raw_params() {
            if p == 4 {
                self.fb.ds.insert_mode = false;
            }
        }
    }

    fn decstbm(&mut self) {
        let top = self.dispatcher.getparam(0, 1) - 1;
        let bottom = self.dispatcher.getparam(1, self.fb.height() as i64) - 1;
        if top < bottom && bottom < self.fb.height() as i64 {
            self.fb.ds.scrolling_region_top = top as usize;
            self.fb.ds.scrolling_region_bottom = bottom as usize;
        }
        self.fb.ds.cursor_row = self.fb.ds.limit_top();
        self.fb.ds.cursor_col = 0;
    }

    fn sgr(&mut self) {
        let params = self.dispatcher.raw_params();
        self.fb.ds.renditions.set_rendition(&params);
    }

    fn dsr(&mut self) {
        match self.dispatcher.getparam(0, 0) {
            5 => self.reply("\u{1b}[0n"),
            6 => {
                let row = self.fb.ds.cursor_row + 1;
                let col = self.fb.ds.cursor_col + 1;
                self.reply(&format!("\u{1b}[{row};{col}R"));
            }
            _ => {}
        }
    }

    fn il(&mut self) {
        let n = self.dispatcher.getparam(0, 1) as usize;
        let row = self.fb.ds.cursor_row;
        self.fb.insert_line(row, n);
    }
    fn dl(&mut self) {
        let n = self.dispatcher.getparam(0, 1) as usize;
        let row = self.fb.ds.cursor_row;
        self.fb.delete_line(row, n);
    }

    fn ich(&mut self) {
        let n = self.dispatcher.getparam(0, 1) as usize;
        let background = self.fb.background_renditions();
        let (row, col) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col);
        self.fb.row_mut(row).insert_cell(col, n, background);
    }
    fn dch(&mut self) {
        let n = self.dispatcher.getparam(0, 1) as usize;
        let background = self.fb.background_renditions();
        let (row, col) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col);
        self.fb.row_mut(row).delete_cell(col, n, background);
    }
    fn ech(&mut self) {
        let n = self.dispatcher.getparam(0, 1) as usize;
        let background = self.fb.background_renditions();
        let (row, col, width) = (self.fb.ds.cursor_row, self.fb.ds.cursor_col, self.fb.width());
        let r = self.fb.row_mut(row);
        for c in col..(col + n).min(width) {
            r.cell_mut(c).reset(background);
        }
    }

    fn tbc(&mut self) {
        match self.dispatcher.getparam(0, 0) {
            0 => {
                let col = self.fb.ds.cursor_col;
                self.fb.ds.clear_tabstop(col);
            }
            3 => self.fb.ds.clear_all_tabstops(),
            _ => {}
        }
    }

    fn decstr(&mut self) {
        self.fb.soft_reset();
    }

    fn osc_dispatch(&mut self) {
        let buf = self.osc_buffer.clone();
        let mut parts = buf.splitn(2, ';');
        let code = parts.next().unwrap_or("");
        let text = parts.next().unwrap_or("").to_string();
        match code {
            "0" => {
                self.fb.set_icon_name(text.clone());
                self.fb.set_window_title(text);
            }
            "1" => self.fb.set_icon_name(text),
            "2" => self.fb.set_window_title(text),
            _ => {}
        }
    }
}
