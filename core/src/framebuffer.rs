//! Fixed-size cell grid with bounded scrollback, cursor, and style state.
//!
//! Every public operation leaves the grid at exactly `width * height` cells,
//! the scrollback at or under its capacity, and the cursor in bounds.

use std::collections::VecDeque;

use crate::cell::{Cell, Style};

const TAB_STOP: u16 = 8;

type Row = Vec<Cell>;

fn blank_row(width: u16) -> Row {
    vec![Cell::blank(); width as usize]
}

pub struct Framebuffer {
    width: u16,
    height: u16,
    scrollback_cap: usize,
    grid: Vec<Row>,
    scrollback: VecDeque<Row>,
    cursor: (u16, u16),
    saved_cursor: Option<(u16, u16)>,
    current_style: Style,
    scroll_offset: usize,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16, scrollback_cap: usize) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            scrollback_cap,
            grid: (0..height).map(|_| blank_row(width)).collect(),
            scrollback: VecDeque::new(),
            cursor: (0, 0),
            saved_cursor: None,
            current_style: Style::reset(),
            scroll_offset: 0,
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn cursor(&self) -> (u16, u16) {
        self.cursor
    }

    pub fn current_style(&self) -> Style {
        self.current_style
    }

    pub fn set_style(&mut self, style: Style) {
        self.current_style = style;
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    fn clamp_cursor(&mut self) {
        self.cursor.0 = self.cursor.0.min(self.width - 1);
        self.cursor.1 = self.cursor.1.min(self.height - 1);
    }

    pub fn write(&mut self, ch: char) {
        if self.cursor.1 >= self.height {
            self.scroll_up(1);
            self.cursor.1 = self.height - 1;
        }
        if self.cursor.0 >= self.width {
            self.cursor.0 = 0;
            self.cursor.1 += 1;
            if self.cursor.1 >= self.height {
                self.scroll_up(1);
                self.cursor.1 = self.height - 1;
            }
        }
        if self.cursor.1 < self.height && self.cursor.0 < self.width {
            self.grid[self.cursor.1 as usize][self.cursor.0 as usize] = Cell {
                ch,
                style: self.current_style,
            };
            self.cursor.0 += 1;
        }
    }

    pub fn newline(&mut self) {
        self.cursor.0 = 0;
        if self.cursor.1 + 1 >= self.height {
            self.scroll_up(1);
        } else {
            self.cursor.1 += 1;
        }
    }

    pub fn carriage_return(&mut self) {
        self.cursor.0 = 0;
    }

    pub fn backspace(&mut self) {
        self.cursor.0 = self.cursor.0.saturating_sub(1);
    }

    pub fn tab(&mut self) {
        loop {
            self.write(' ');
            if self.cursor.0 % TAB_STOP == 0 {
                break;
            }
        }
    }

    pub fn move_cursor(&mut self, x: Option<u16>, y: Option<u16>) {
        if let Some(x) = x {
            self.cursor.0 = x;
        }
        if let Some(y) = y {
            self.cursor.1 = y;
        }
        self.clamp_cursor();
    }

    fn clear_row(&mut self, y: usize) {
        self.grid[y] = blank_row(self.width);
    }

    pub fn clear_line(&mut self, mode: u8) {
        let y = self.cursor.1 as usize;
        let w = self.width as usize;
        let x = self.cursor.0 as usize;
        match mode {
            0 => {
                for c in &mut self.grid[y][x..w] {
                    *c = Cell::blank();
                }
            }
            1 => {
                for c in &mut self.grid[y][0..=x.min(w - 1)] {
                    *c = Cell::blank();
                }
            }
            2 => self.clear_row(y),
            _ => {}
        }
    }

    pub fn clear_screen(&mut self, mode: u8) {
        let h = self.height as usize;
        match mode {
            0 => {
                self.clear_line(0);
                for y in (self.cursor.1 as usize + 1)..h {
                    self.clear_row(y);
                }
            }
            1 => {
                for y in 0..self.cursor.1 as usize {
                    self.clear_row(y);
                }
                self.clear_line(1);
            }
            2 => {
                for y in 0..h {
                    self.clear_row(y);
                }
            }
            _ => {}
        }
    }

    pub fn scroll_up(&mut self, n: usize) {
        let n = n.min(self.height as usize);
        for _ in 0..n {
            let row = self.grid.remove(0);
            self.scrollback.push_back(row);
            if self.scrollback.len() > self.scrollback_cap {
                self.scrollback.pop_front();
            }
            self.grid.push(blank_row(self.width));
        }
    }

    /// Scrolls the live grid without consulting scrollback (intentional: this
    /// is a viewport shift, not a history replay — use `scroll_page` for that).
    pub fn scroll_down(&mut self, n: usize) {
        let n = n.min(self.height as usize);
        for _ in 0..n {
            self.grid.pop();
            self.grid.insert(0, blank_row(self.width));
        }
    }

    /// Moves the scrollback viewport (pager support for `[PGUP]`/`[PGDN]`).
    /// Positive `n` pages into history, negative pages back toward live output.
    pub fn scroll_page(&mut self, n: i64) {
        let max = self.scrollback.len() as i64;
        let new = (self.scroll_offset as i64 + n).clamp(0, max);
        self.scroll_offset = new as usize;
    }

    pub fn save_cursor(&mut self) {
        self.saved_cursor = Some(self.cursor);
    }

    pub fn restore_cursor(&mut self) {
        if let Some(pos) = self.saved_cursor {
            self.cursor = pos;
            self.clamp_cursor();
        }
    }

    pub fn insert_chars(&mut self, n: usize) {
        let y = self.cursor.1 as usize;
        let x = (self.cursor.0 as usize).min(self.width as usize);
        let w = self.width as usize;
        for _ in 0..n {
            self.grid[y].insert(x, Cell::blank());
        }
        self.grid[y].truncate(w);
    }

    pub fn delete_chars(&mut self, n: usize) {
        let y = self.cursor.1 as usize;
        let w = self.width as usize;
        let x = (self.cursor.0 as usize).min(w);
        let end = (x + n).min(w);
        self.grid[y].drain(x..end);
        while self.grid[y].len() < w {
            self.grid[y].push(Cell::blank());
        }
    }

    pub fn insert_lines(&mut self, n: usize) {
        let y = self.cursor.1 as usize;
        let h = self.height as usize;
        for _ in 0..n {
            if y <= self.grid.len() {
                self.grid.insert(y, blank_row(self.width));
            }
        }
        self.grid.truncate(h);
    }

    pub fn delete_lines(&mut self, n: usize) {
        let y = self.cursor.1 as usize;
        let h = self.height as usize;
        let n = n.min(h.saturating_sub(y));
        for _ in 0..n {
            if y < self.grid.len() {
                self.grid.remove(y);
            }
        }
        while self.grid.len() < h {
            self.grid.push(blank_row(self.width));
        }
    }

    /// Resets to a blank live grid, dropping scrollback and cursor state.
    /// Used to compose the final "session closed" frame.
    pub fn clear(&mut self) {
        self.grid = (0..self.height).map(|_| blank_row(self.width)).collect();
        self.scrollback.clear();
        self.cursor = (0, 0);
        self.saved_cursor = None;
        self.scroll_offset = 0;
    }

    /// Writes `text` into the given row, centered, overwriting its contents.
    /// Used for status frames like "shell session closed".
    pub fn write_centered(&mut self, row: u16, text: &str) {
        let row = row.min(self.height - 1) as usize;
        self.grid[row] = blank_row(self.width);
        let w = self.width as usize;
        let chars: Vec<char> = text.chars().take(w).collect();
        let start = (w.saturating_sub(chars.len())) / 2;
        for (i, ch) in chars.into_iter().enumerate() {
            self.grid[row][start + i] = Cell {
                ch,
                style: self.current_style,
            };
        }
    }

    fn viewport_rows(&self) -> Vec<Row> {
        if self.scroll_offset == 0 {
            return self.grid.clone();
        }
        let h = self.height as usize;
        let sb_len = self.scrollback.len();
        let offset = self.scroll_offset.min(sb_len);
        let start = sb_len - offset;
        let mut rows = Vec::with_capacity(h);
        for i in start..sb_len {
            rows.push(self.scrollback[i].clone());
            if rows.len() == h {
                break;
            }
        }
        if rows.len() < h {
            for row in self.grid.iter() {
                rows.push(row.clone());
                if rows.len() == h {
                    break;
                }
            }
        }
        rows
    }

    fn render_row(&self, row: &[Cell], cursor_col: Option<usize>, show_cursor: bool) -> String {
        let mut s = String::new();
        let mut last_style: Option<Style> = None;
        for (i, cell) in row.iter().enumerate() {
            let invert = show_cursor && cursor_col == Some(i);
            let eff_style = if invert { cell.style.inverted() } else { cell.style };
            if last_style != Some(eff_style) {
                s.push_str(&eff_style.to_escape());
                last_style = Some(eff_style);
            }
            s.push(cell.ch);
        }
        s
    }

    /// Renders the visible viewport as one string per row, honoring
    /// `scroll_offset`. The cursor cell, if visible, is rendered inverted
    /// independent of its own style. Trailing all-blank rows collapse to a
    /// single space so the surface doesn't trim them away as empty lines.
    pub fn render(&self, show_cursor: bool) -> Vec<String> {
        let viewport = self.viewport_rows();
        let mut rendered: Vec<(String, bool)> = Vec::with_capacity(viewport.len());
        for (row_idx, row) in viewport.iter().enumerate() {
            let is_cursor_row = self.scroll_offset == 0 && row_idx == self.cursor.1 as usize;
            let cursor_col = if is_cursor_row {
                Some(self.cursor.0 as usize)
            } else {
                None
            };
            let has_cursor = show_cursor && cursor_col.is_some();
            let all_blank = row.iter().all(|c| c.ch == ' ' && c.style == Style::default());
            let text = self.render_row(row, cursor_col, show_cursor);
            rendered.push((text, all_blank && !has_cursor));
        }
        let mut out = vec![String::new(); rendered.len()];
        let mut trailing = true;
        for i in (0..rendered.len()).rev() {
            let (text, blank) = &rendered[i];
            if trailing && *blank {
                out[i] = " ".to_string();
            } else {
                trailing = false;
                out[i] = text.clone();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_rows(fb: &Framebuffer) -> Vec<String> {
        fb.render(false)
    }

    #[test]
    fn write_wraps_to_next_row() {
        let mut fb = Framebuffer::new(10, 3, 100);
        for ch in "hello worl".chars() {
            fb.write(ch);
        }
        fb.write('d');
        assert_eq!(fb.cursor(), (1, 1));
        let rows = plain_rows(&fb);
        assert!(rows[0].ends_with("hello worl"));
        assert!(rows[1].ends_with('d') || rows[1].contains('d'));
    }

    #[test]
    fn three_newlines_scroll_into_history() {
        // cursor starts at row 0; the first two newlines move it down without
        // scrolling (rows 1, 2), the third is the one that overflows.
        let mut fb = Framebuffer::new(10, 3, 100);
        fb.newline();
        fb.newline();
        fb.newline();
        assert_eq!(fb.scrollback_len(), 1);
        assert_eq!(fb.cursor(), (0, 2));
    }

    #[test]
    fn clear_line_mode_zero_erases_from_cursor() {
        let mut fb = Framebuffer::new(10, 3, 100);
        for ch in "abcdefghij".chars() {
            fb.write(ch);
        }
        fb.move_cursor(Some(5), Some(0));
        fb.clear_line(0);
        let rows = plain_rows(&fb);
        assert!(rows[0].contains("abcde"));
        assert_eq!(fb.cursor(), (5, 0));
    }

    #[test]
    fn scrollback_never_exceeds_capacity() {
        let mut fb = Framebuffer::new(10, 3, 5);
        for _ in 0..20 {
            fb.newline();
        }
        assert!(fb.scrollback_len() <= 5);
    }

    #[test]
    fn save_and_restore_cursor_position_only() {
        let mut fb = Framebuffer::new(10, 3, 100);
        fb.move_cursor(Some(2), Some(1));
        fb.save_cursor();
        fb.move_cursor(Some(9), Some(2));
        fb.restore_cursor();
        assert_eq!(fb.cursor(), (2, 1));
    }

    #[test]
    fn cursor_stays_in_bounds_after_move() {
        let mut fb = Framebuffer::new(10, 3, 100);
        fb.move_cursor(Some(99), Some(99));
        assert_eq!(fb.cursor(), (9, 2));
    }
}
