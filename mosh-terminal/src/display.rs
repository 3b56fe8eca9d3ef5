//! Renders the difference between two framebuffers as an ANSI/ECMA-48 byte
//! string the remote terminal emulator can replay to reach the new frame
//! without retransmitting the whole screen.
//!
//! Assumes a reasonably modern terminal (background color erase, `ECH`
//! support) rather than querying terminfo capabilities, since the crate has
//! no terminfo/termcap binding in its dependency stack; see DESIGN.md.

use crate::cell::{Cell, Renditions};
use crate::framebuffer::{Framebuffer, Row};

const NBSP: char = '\u{a0}';

/// Escape sequence that enters the alternate screen and application
/// keypad/cursor mode; sent once at startup.
pub const OPEN_SEQUENCE: &str = "\x1b[?1049h\x1b[?1h";

/// Escape sequence that restores the primary screen and default modes;
/// sent once at shutdown.
pub const CLOSE_SEQUENCE: &str = "\x1b[?1l\x1b[0m\x1b[?25h\x1b[?1049l";

struct FrameState {
    out: String,
    cursor_x: i64,
    cursor_y: i64,
    current_rendition: Renditions,
    cursor_visible: bool,
}

impl FrameState {
    fn new(last: &Framebuffer) -> Self {
        Self {
            out: String::with_capacity(last.width() * last.height() * 4),
            cursor_x: 0,
            cursor_y: 0,
            current_rendition: Renditions::default(),
            cursor_visible: last.ds.cursor_visible,
        }
    }

    fn append(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn append_repeat(&mut self, ch: char, count: usize) {
        for _ in 0..count {
            self.out.push(ch);
        }
    }

    fn append_cell(&mut self, cell: &Cell) {
        if cell.contents().is_empty() {
            self.out.push(' ');
            return;
        }
        if cell.fallback {
            self.out.push(NBSP);
        }
        for &ch in cell.contents() {
            self.out.push(ch);
        }
    }

    fn append_silent_move(&mut self, y: i64, x: i64) {
        if self.cursor_x == x && self.cursor_y == y {
            return;
        }
        if self.cursor_visible {
            self.append("\x1b[?25l");
            self.cursor_visible = false;
        }
        self.append_move(y, x);
    }

    fn append_move(&mut self, y: i64, x: i64) {
        if self.cursor_x != -1 && self.cursor_y != -1 && x == 0 && y - self.cursor_y >= 0 && y - self.cursor_y < 5 {
            if self.cursor_x != 0 {
                self.out.push('\r');
            }
            self.append_repeat('\n', (y - self.cursor_y) as usize);
        } else {
            self.append(&format!("\x1b[{};{}H", y + 1, x + 1));
        }
        self.cursor_x = x;
        self.cursor_y = y;
    }

    fn update_rendition(&mut self, r: Renditions, force: bool) {
        if force || self.current_rendition != r {
            self.append(&r.to_sgr_escape());
            self.current_rendition = r;
        }
    }
}

/// Produces the byte string that, replayed by an ANSI terminal currently
/// showing `last`, reproduces `new`. `initialized` should be `false` only
/// for the very first frame sent to a fresh terminal.
pub fn new_frame(initialized: bool, last: &Framebuffer, new: &Framebuffer) -> String {
    let mut frame = FrameState::new(last);
    let mut initialized = initialized;

    if new.bell_count != last.bell_count {
        frame.append("\x07");
    }

    if new.title_initialized
        && (!initialized || new.icon_name != last.icon_name || new.window_title != last.window_title)
    {
        if new.icon_name == new.window_title {
            frame.append("\x1b]0;");
            frame.append(&new.window_title);
            frame.append("\x07");
        } else {
            frame.append("\x1b]1;");
            frame.append(&new.icon_name);
            frame.append("\x07");
            frame.append("\x1b]2;");
            frame.append(&new.window_title);
            frame.append("\x07");
        }
    }

    if !initialized || new.ds.reverse_video != last.ds.reverse_video {
        frame.append(if new.ds.reverse_video { "\x1b[?5h" } else { "\x1b[?5l" });
    }

    let size_changed = new.width() != last.width() || new.height() != last.height();
    if !initialized || size_changed {
        frame.append("\x1b[r");
        frame.append("\x1b[0m\x1b[H\x1b[2J");
        initialized = false;
        frame.cursor_x = 0;
        frame.cursor_y = 0;
        frame.current_rendition = Renditions::default();
    } else {
        frame.cursor_x = last.ds.cursor_col as i64;
        frame.cursor_y = last.ds.cursor_row as i64;
        frame.current_rendition = last.ds.renditions;
    }

    if !initialized {
        frame.cursor_visible = false;
        frame.append("\x1b[?25l");
    }

    let blank_row = Row::new(new.width(), Renditions::default());
    let mut rows: Vec<&Row> = (0..new.height())
        .map(|i| if i < last.rows().len() { &last.rows()[i] } else { &blank_row })
        .collect();

    let mut frame_y = 0usize;

    if initialized {
        let mut lines_scrolled = 0usize;
        let mut scroll_height = 0usize;

        for row in 0..new.height() {
            let new_row = new.row(0);
            let old_row = rows[row];
            if new_row == old_row {
                if row == 0 {
                    break;
                }
                lines_scrolled = row;
                scroll_height = 1;
                let mut region_height = 1;
                while lines_scrolled + region_height < new.height() {
                    if new.row(region_height) == rows[lines_scrolled + region_height] {
                        scroll_height = region_height + 1;
                        region_height += 1;
                    } else {
                        break;
                    }
                }
                break;
            }
        }

        if scroll_height > 0 {
            frame_y = scroll_height;

            if lines_scrolled > 0 {
                frame.update_rendition(Renditions::default(), true);

                let top_margin = 0;
                let bottom_margin = top_margin + lines_scrolled + scroll_height - 1;

                if scroll_height + lines_scrolled == new.height() && frame.cursor_y + 1 == new.height() as i64 {
                    frame.append("\r");
                    frame.append_repeat('\n', lines_scrolled);
                    frame.cursor_x = 0;
                } else {
                    frame.append(&format!("\x1b[{};{}r", top_margin + 1, bottom_margin + 1));
                    frame.cursor_x = -1;
                    frame.cursor_y = -1;
                    frame.append_silent_move(bottom_margin as i64, 0);
                    frame.append_repeat('\n', lines_scrolled);
                    frame.append("\x1b[r");
                    frame.cursor_x = -1;
                    frame.cursor_y = -1;
                }

                for i in top_margin..=bottom_margin {
                    if i + lines_scrolled <= bottom_margin {
                        rows[i] = rows[i + lines_scrolled];
                    } else {
                        rows[i] = &blank_row;
                    }
                }
            }
        }
    }

    let mut wrap = false;
    for y in frame_y..new.height() {
        wrap = put_row(initialized, &mut frame, new, y, rows[y], wrap);
    }

    if !initialized || new.ds.cursor_row as i64 != frame.cursor_y || new.ds.cursor_col as i64 != frame.cursor_x {
        frame.append_move(new.ds.cursor_row as i64, new.ds.cursor_col as i64);
    }

    if !initialized || new.ds.cursor_visible != frame.cursor_visible {
        frame.append(if new.ds.cursor_visible { "\x1b[?25h" } else { "\x1b[?25l" });
    }

    frame.update_rendition(new.ds.renditions, !initialized);

    if !initialized || new.ds.bracketed_paste != last.ds.bracketed_paste {
        frame.append(if new.ds.bracketed_paste { "\x1b[?2004h" } else { "\x1b[?2004l" });
    }
    if !initialized || new.ds.mouse_reporting_mode_vt100 != last.ds.mouse_reporting_mode_vt100 {
        frame.append(if new.ds.mouse_reporting_mode_vt100 { "\x1b[?1000h" } else { "\x1b[?1000l" });
    }
    if !initialized || new.ds.mouse_reporting_mode_xterm != last.ds.mouse_reporting_mode_xterm {
        frame.append(if new.ds.mouse_reporting_mode_xterm { "\x1b[?1002h" } else { "\x1b[?1002l" });
    }
    if !initialized || new.ds.mouse_reporting_mode_sgr != last.ds.mouse_reporting_mode_sgr {
        frame.append(if new.ds.mouse_reporting_mode_sgr { "\x1b[?1006h\x1b[?1002h" } else { "\x1b[?1006l\x1b[?1002l" });
    }

    frame.out
}

fn row_wrap(row: &Row) -> bool {
    row.cells().last().map(|c| c.wrap).unwrap_or(false)
}

fn put_row(initialized: bool, frame: &mut FrameState, new: &Framebuffer, frame_y: usize, old_row: &Row, wrap: bool) -> bool {
    let row = new.row(frame_y);
    let mut frame_x = 0usize;

    if wrap {
        let cell = row.cell(0);
        frame.update_rendition(cell.renditions, false);
        frame.append_cell(cell);
        frame_x += if cell.wide { 2 } else { 1 };
        frame.cursor_x += if cell.wide { 2 } else { 1 };
    }

    if initialized && row == old_row {
        return false;
    }

    let mut clear_count = 0usize;
    let mut wrote_last_cell = false;
    let mut blank_renditions = Renditions::default();

    while frame_x < new.width() {
        let cell = row.cell(frame_x);
        let width = if cell.wide { 2 } else { 1 };

        if initialized && clear_count == 0 && cell == old_row.cell(frame_x) {
            frame_x += width;
            continue;
        }

        if cell.contents().is_empty() {
            if clear_count == 0 {
                blank_renditions = cell.renditions;
            }
            if cell.renditions == blank_renditions {
                clear_count += 1;
                frame_x += 1;
                continue;
            }
        }

        if clear_count > 0 {
            frame.append_silent_move(frame_y as i64, (frame_x - clear_count) as i64);
            frame.update_rendition(blank_renditions, false);
            // Background-color erase is assumed available, so ECH is always
            // safe to use for a mid-row blank run.
            frame.append(&format!("\x1b[{clear_count}X"));
            clear_count = 0;
            if cell.contents().is_empty() {
                blank_renditions = cell.renditions;
                clear_count = 1;
                frame_x += 1;
                continue;
            }
        }

        frame.append_silent_move(frame_y as i64, frame_x as i64);
        frame.update_rendition(cell.renditions, false);
        frame.append_cell(cell);
        frame_x += width;
        frame.cursor_x += width as i64;
        if frame_x >= new.width() {
            wrote_last_cell = true;
        }
    }

    if clear_count > 0 {
        frame.append_silent_move(frame_y as i64, (frame_x - clear_count) as i64);
        frame.update_rendition(blank_renditions, false);

        // `\033[K` would also clear a row that's about to receive a
        // natural wrap, which must instead keep its trailing cell content.
        if !row_wrap(row) {
            frame.append("\x1b[K");
        } else {
            frame.append_repeat(' ', clear_count);
            frame.cursor_x = frame_x as i64;
            wrote_last_cell = true;
        }
    }

    if wrote_last_cell && frame_y < new.height() - 1 {
        if row_wrap(row) {
            frame.cursor_x = 0;
            frame.cursor_y += 1;
            return true;
        } else {
            frame.append("\r\n");
            frame.cursor_x = 0;
            frame.cursor_y += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;

    #[test]
    fn first_frame_contains_full_contents() {
        let last = Framebuffer::new(10, 3);
        let mut new = Framebuffer::new(10, 3);
        new.row_mut(0).cell_mut(0).set_character('x');

        let out = new_frame(false, &last, &new);
        assert!(out.contains('x'));
        assert!(out.contains("\x1b[2J"));
    }

    #[test]
    fn unchanged_frame_produces_minimal_output() {
        let fb = Framebuffer::new(10, 3);
        let out = new_frame(true, &fb, &fb);
        assert!(!out.contains("\x1b[2J"));
    }

    #[test]
    fn bell_emits_bel_character() {
        let last = Framebuffer::new(5, 2);
        let mut new = last.clone();
        new.bell();
        let out = new_frame(true, &last, &new);
        assert!(out.contains('\x07'));
    }

    #[test]
    fn combined_title_uses_single_osc0() {
        let last = Framebuffer::new(5, 2);
        let mut new = last.clone();
        new.set_window_title("hi".into());
        new.set_icon_name("hi".into());
        let out = new_frame(true, &last, &new);
        assert!(out.contains("\x1b]0;hi\x07"));
    }

    #[test]
    fn distinct_icon_and_title_use_separate_osc() {
        let last = Framebuffer::new(5, 2);
        let mut new = last.clone();
        new.set_window_title("title".into());
        new.set_icon_name("icon".into());
        let out = new_frame(true, &last, &new);
        assert!(out.contains("\x1b]1;icon\x07"));
        assert!(out.contains("\x1b]2;title\x07"));
    }

    #[test]
    fn size_change_forces_full_redraw() {
        let last = Framebuffer::new(5, 2);
        let new = Framebuffer::new(8, 4);
        let out = new_frame(true, &last, &new);
        assert!(out.contains("\x1b[2J"));
    }
}
