use crate::cell::{Cell, Renditions};

/// One row of cells plus whether the row's last cell was marked `wrap`
/// (used by the display to decide whether a terminal may let the cursor
/// wrap naturally rather than emitting an explicit CR/LF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    cells: Vec<Cell>,
}

impl Row {
    pub fn new(width: usize, background: Renditions) -> Self {
        let mut cell = Cell::blank();
        cell.renditions = background;
        Self {
            cells: vec![cell; width],
        }
    }

    pub fn width(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, col: usize) -> &Cell {
        &self.cells[col]
    }

    pub fn cell_mut(&mut self, col: usize) -> &mut Cell {
        &mut self.cells[col]
    }

    /// Inserts `count` blank cells at `col`, shifting existing cells right
    /// and truncating the overflow off the end of the row.
    pub fn insert_cell(&mut self, col: usize, count: usize, background: Renditions) {
        let width = self.cells.len();
        let mut blank = Cell::blank();
        blank.renditions = background;
        for _ in 0..count {
            if col < self.cells.len() {
                self.cells.insert(col, blank.clone());
            }
        }
        self.cells.truncate(width);
    }

    /// Deletes `count` cells starting at `col`, shifting the remainder left
    /// and padding the end with blanks.
    pub fn delete_cell(&mut self, col: usize, count: usize, background: Renditions) {
        let width = self.cells.len();
        let end = (col + count).min(width);
        self.cells.drain(col..end);
        let mut blank = Cell::blank();
        blank.renditions = background;
        while self.cells.len() < width {
            self.cells.push(blank.clone());
        }
    }

    pub fn resize(&mut self, width: usize, background: Renditions) {
        let mut blank = Cell::blank();
        blank.renditions = background;
        self.cells.resize(width, blank);
    }
}

/// Cursor position, rendition, and the handful of boolean modes saved and
/// restored by `DECSC`/`DECRC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedCursor {
    pub cursor_row: usize,
    pub cursor_col: usize,
    pub renditions: Renditions,
    pub auto_wrap_mode: bool,
    pub origin_mode: bool,
}

/// Everything that is not the grid of cells: cursor position, the
/// scrolling region, tab stops, current renditions, saved-cursor slot, and
/// the various boolean modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawState {
    pub width: usize,
    pub height: usize,
    pub cursor_row: usize,
    pub cursor_col: usize,
    pub combining_char_col: usize,
    pub combining_char_row: usize,
    tabs: Vec<bool>,
    pub scrolling_region_top: usize,
    pub scrolling_region_bottom: usize,
    pub renditions: Renditions,
    pub save: SavedCursor,
    pub next_print_will_wrap: bool,
    pub origin_mode: bool,
    pub auto_wrap_mode: bool,
    pub insert_mode: bool,
    pub cursor_visible: bool,
    pub reverse_video: bool,
    pub application_mode_cursor_keys: bool,
    pub bracketed_paste: bool,
    pub mouse_reporting_mode_vt100: bool,
    pub mouse_reporting_mode_xterm: bool,
    pub mouse_reporting_mode_sgr: bool,
    pub mouse_focus: bool,
}

const DEFAULT_TABSTOP: usize = 8;

impl DrawState {
    pub fn new(width: usize, height: usize) -> Self {
        let mut ds = Self {
            width,
            height,
            cursor_row: 0,
            cursor_col: 0,
            combining_char_col: 0,
            combining_char_row: 0,
            tabs: vec![false; width],
            scrolling_region_top: 0,
            scrolling_region_bottom: height.saturating_sub(1),
            renditions: Renditions::default(),
            save: SavedCursor::default(),
            next_print_will_wrap: false,
            origin_mode: false,
            auto_wrap_mode: true,
            insert_mode: false,
            cursor_visible: true,
            reverse_video: false,
            application_mode_cursor_keys: false,
            bracketed_paste: false,
            mouse_reporting_mode_vt100: false,
            mouse_reporting_mode_xterm: false,
            mouse_reporting_mode_sgr: false,
            mouse_focus: false,
        };
        ds.default_tabs();
        ds
    }

    pub fn get_width(&self) -> usize {
        self.width
    }

    pub fn get_height(&self) -> usize {
        self.height
    }

    fn default_tabs(&mut self) {
        for (i, tab) in self.tabs.iter_mut().enumerate() {
            *tab = i % DEFAULT_TABSTOP == 0;
        }
    }

    pub fn clear_tabstop(&mut self, col: usize) {
        if col < self.tabs.len() {
            self.tabs[col] = false;
        }
    }

    pub fn clear_all_tabstops(&mut self) {
        for t in self.tabs.iter_mut() {
            *t = false;
        }
    }

    pub fn set_tabstop(&mut self) {
        let col = self.cursor_col;
        if col < self.tabs.len() {
            self.tabs[col] = true;
        }
    }

    /// Next tab stop at or after `col + 1`, clamped to the last column.
    pub fn get_next_tab(&self) -> Option<usize> {
        ((self.cursor_col + 1)..self.width).find(|&c| self.tabs[c])
    }

    pub fn limit_top(&self) -> usize {
        if self.origin_mode {
            self.scrolling_region_top
        } else {
            0
        }
    }

    pub fn limit_bottom(&self) -> usize {
        if self.origin_mode {
            self.scrolling_region_bottom
        } else {
            self.height - 1
        }
    }

    pub fn move_row(&mut self, n: i64, relative: bool) {
        let target = if relative {
            self.cursor_row as i64 + n
        } else {
            n + self.limit_top() as i64
        };
        self.cursor_row = target.clamp(self.limit_top() as i64, self.limit_bottom() as i64) as usize;
        self.next_print_will_wrap = false;
    }

    pub fn move_col(&mut self, n: i64, relative: bool, relative_to_cursor: bool) {
        let target = if relative_to_cursor {
            self.cursor_col as i64 + n
        } else if relative {
            self.cursor_col as i64 + n
        } else {
            n
        };
        self.cursor_col = target.clamp(0, self.width as i64 - 1) as usize;
        self.next_print_will_wrap = false;
    }

    pub fn snap_cursor_to_border(&mut self) {
        self.cursor_row = self.cursor_row.clamp(self.limit_top(), self.limit_bottom());
        self.cursor_col = self.cursor_col.min(self.width.saturating_sub(1));
    }

    pub fn save_cursor(&mut self) {
        self.save = SavedCursor {
            cursor_row: self.cursor_row,
            cursor_col: self.cursor_col,
            renditions: self.renditions,
            auto_wrap_mode: self.auto_wrap_mode,
            origin_mode: self.origin_mode,
        };
    }

    pub fn restore_cursor(&mut self) {
        let s = self.save;
        self.cursor_row = s.cursor_row.min(self.height - 1);
        self.cursor_col = s.cursor_col.min(self.width - 1);
        self.renditions = s.renditions;
        self.auto_wrap_mode = s.auto_wrap_mode;
        self.origin_mode = s.origin_mode;
        self.next_print_will_wrap = false;
    }

    pub fn new_grapheme(&mut self) {
        self.combining_char_row = self.cursor_row;
        self.combining_char_col = self.cursor_col;
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.tabs.resize(width, false);
        self.default_tabs();
        self.scrolling_region_top = 0;
        self.scrolling_region_bottom = height.saturating_sub(1);
        self.snap_cursor_to_border();
    }

    /// DECSTR: reset the mutable-but-not-structural bits. Mirrors
    /// `DrawState`'s portion of `Framebuffer::soft_reset`.
    pub fn soft_reset(&mut self) {
        self.cursor_visible = true;
        self.origin_mode = false;
        self.scrolling_region_top = 0;
        self.scrolling_region_bottom = self.height.saturating_sub(1);
        self.save = SavedCursor::default();
        self.renditions = Renditions::default();
        self.insert_mode = false;
    }
}

/// The whole terminal surface: the cell grid, draw state, and the window
/// chrome the host can set (title, icon name, bell counter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    rows: Vec<Row>,
    pub ds: DrawState,
    pub window_title: String,
    pub icon_name: String,
    pub bell_count: u64,
    pub title_initialized: bool,
}

impl Framebuffer {
    pub fn new(width: usize, height: usize) -> Self {
        let ds = DrawState::new(width, height);
        Self {
            rows: (0..height).map(|_| Row::new(width, Renditions::default())).collect(),
            ds,
            window_title: String::new(),
            icon_name: String::new(),
            bell_count: 0,
            title_initialized: false,
        }
    }

    pub fn width(&self) -> usize {
        self.ds.width
    }

    pub fn height(&self) -> usize {
        self.ds.height
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, n: usize) -> &Row {
        &self.rows[n]
    }

    pub fn row_mut(&mut self, n: usize) -> &mut Row {
        &mut self.rows[n]
    }

    pub fn cursor_cell(&self) -> &Cell {
        self.rows[self.ds.cursor_row].cell(self.ds.cursor_col)
    }

    pub fn get_combining_cell(&mut self) -> &mut Cell {
        let (r, c) = (self.ds.combining_char_row, self.ds.combining_char_col);
        self.rows[r].cell_mut(c)
    }

    pub fn background_renditions(&self) -> Renditions {
        self.ds.renditions
    }

    /// Scrolls the scrolling region up by `n` rows (positive) bringing in
    /// blank rows at the bottom, or down (negative) bringing in blanks at
    /// the top, matching `Framebuffer::scroll`.
    pub fn scroll(&mut self, n: i64) {
        let top = self.ds.scrolling_region_top;
        let bottom = self.ds.scrolling_region_bottom;
        if top > bottom || bottom >= self.rows.len() {
            return;
        }
        let region_height = bottom - top + 1;
        let background = self.ds.renditions;
        if n > 0 {
            let n = (n as usize).min(region_height);
            self.rows.drain(top..top + n);
            for _ in 0..n {
                self.rows.insert(top + region_height - n, Row::new(self.ds.width, background));
            }
        } else if n < 0 {
            let n = ((-n) as usize).min(region_height);
            self.rows.drain(bottom + 1 - n..=bottom);
            for _ in 0..n {
                self.rows.insert(top, Row::new(self.ds.width, background));
            }
        }
    }

    /// Moves the cursor down by `n` rows (or up, if negative), scrolling
    /// the region when the cursor would otherwise leave it -- the
    /// autoscroll behavior shared by LF/IND/RI/CUD-at-bottom.
    pub fn move_rows_autoscroll(&mut self, n: i64) {
        let new_row = self.ds.cursor_row as i64 + n;
        let (top, bottom) = (self.ds.scrolling_region_top as i64, self.ds.scrolling_region_bottom as i64);
        if n > 0 {
            if self.ds.cursor_row as i64 <= bottom && new_row > bottom {
                self.scroll(new_row - bottom);
                self.ds.cursor_row = bottom as usize;
            } else {
                self.ds.cursor_row = new_row.clamp(0, self.rows.len() as i64 - 1) as usize;
            }
        } else if n < 0 {
            if self.ds.cursor_row as i64 >= top && new_row < top {
                self.scroll(new_row - top);
                self.ds.cursor_row = top as usize;
            } else {
                self.ds.cursor_row = new_row.clamp(0, self.rows.len() as i64 - 1) as usize;
            }
        }
        self.ds.next_print_will_wrap = false;
    }

    pub fn insert_line(&mut self, before: usize, count: usize) {
        if before < self.ds.scrolling_region_top || before > self.ds.scrolling_region_bottom {
            return;
        }
        let saved_top = self.ds.scrolling_region_top;
        let saved_bottom = self.ds.scrolling_region_bottom;
        self.ds.scrolling_region_top = before;
        self.scroll(-(count as i64));
        self.ds.scrolling_region_top = saved_top;
        self.ds.scrolling_region_bottom = saved_bottom;
    }

    pub fn delete_line(&mut self, at: usize, count: usize) {
        if at < self.ds.scrolling_region_top || at > self.ds.scrolling_region_bottom {
            return;
        }
        let saved_top = self.ds.scrolling_region_top;
        self.ds.scrolling_region_top = at;
        self.scroll(count as i64);
        self.ds.scrolling_region_top = saved_top;
    }

    pub fn save_cursor(&mut self) {
        self.ds.save_cursor();
    }

    pub fn restore_cursor(&mut self) {
        self.ds.restore_cursor();
    }

    pub fn set_window_title(&mut self, title: String) {
        self.window_title = title;
        self.title_initialized = true;
    }

    pub fn set_icon_name(&mut self, name: String) {
        self.icon_name = name;
        self.title_initialized = true;
    }

    pub fn prefix_window_title(&mut self, prefix: &str) {
        if !self.window_title.starts_with(prefix) {
            self.window_title = format!("{prefix}{}", self.window_title);
        }
    }

    pub fn bell(&mut self) {
        self.bell_count += 1;
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        if width == self.ds.width && height == self.ds.height {
            return;
        }
        let background = self.ds.renditions;
        if height < self.rows.len() {
            self.rows.truncate(height);
        } else {
            while self.rows.len() < height {
                self.rows.push(Row::new(self.ds.width, background));
            }
        }
        for row in self.rows.iter_mut() {
            row.resize(width, background);
        }
        self.ds.resize(width, height);
    }

    /// `RIS`: full reset to a blank framebuffer of the same size.
    pub fn reset(&mut self) {
        let (w, h) = (self.ds.width, self.ds.height);
        *self = Framebuffer::new(w, h);
    }

    /// `DECSTR`: soft reset. Restores cursor/mode state to defaults but
    /// leaves cell contents untouched.
    pub fn soft_reset(&mut self) {
        self.ds.soft_reset();
    }
}
