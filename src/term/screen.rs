//! VT screen model: a grid of styled cells driven by `vte` parse events.
//!
//! The screen understands the control functions interactive shells and
//! common TUIs actually emit: cursor motion, SGR attributes, erase/insert/
//! delete operations, scrolling regions, and the alternate screen. Lines
//! scrolled off the top of the primary screen land in a bounded scrollback
//! ring.

use std::collections::VecDeque;
use std::fmt::Write as _;

use vte::{Params, Perform};

/// A color in the pane's palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// SGR attributes for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub reverse: bool,
    pub strike: bool,
}

impl Style {
    fn is_default(self) -> bool {
        self == Style::default()
    }
}

/// One character cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub style: Style,
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            ch: ' ',
            style: Style::default(),
        }
    }
}

impl Cell {
    fn is_blank(self) -> bool {
        self.ch == ' ' && self.style.is_default()
    }
}

type Row = Vec<Cell>;

fn blank_row(cols: usize) -> Row {
    vec![Cell::default(); cols]
}

/// The in-memory screen: primary + alternate grids, cursor, scrollback.
///
/// Implements [`vte::Perform`]; feed it through a `vte::Parser` (see
/// [`crate::term::TerminalEmulator`]).
pub struct Screen {
    cols: usize,
    rows: usize,
    grid: Vec<Row>,
    alt_grid: Vec<Row>,
    /// True while the alternate screen (smcup) is active.
    alt_active: bool,
    cursor_x: usize,
    cursor_y: usize,
    saved_cursor: (usize, usize),
    /// Cursor saved when entering the alternate screen (?1049).
    primary_saved_cursor: (usize, usize),
    style: Style,
    /// Scroll region, inclusive rows.
    scroll_top: usize,
    scroll_bottom: usize,
    /// Deferred autowrap: set after printing in the last column.
    pending_wrap: bool,
    cursor_visible: bool,
    scrollback: VecDeque<Row>,
    scrollback_limit: usize,
}

impl Screen {
    pub fn new(cols: u16, rows: u16, scrollback_limit: usize) -> Self {
        let cols = usize::from(cols.max(1));
        let rows = usize::from(rows.max(1));
        Screen {
            cols,
            rows,
            grid: (0..rows).map(|_| blank_row(cols)).collect(),
            alt_grid: (0..rows).map(|_| blank_row(cols)).collect(),
            alt_active: false,
            cursor_x: 0,
            cursor_y: 0,
            saved_cursor: (0, 0),
            primary_saved_cursor: (0, 0),
            style: Style::default(),
            scroll_top: 0,
            scroll_bottom: rows - 1,
            pending_wrap: false,
            cursor_visible: true,
            scrollback: VecDeque::new(),
            scrollback_limit,
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols as u16, self.rows as u16)
    }

    /// Cursor position as (column, row), zero-based.
    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    fn active_grid(&self) -> &Vec<Row> {
        if self.alt_active {
            &self.alt_grid
        } else {
            &self.grid
        }
    }

    fn active_grid_mut(&mut self) -> &mut Vec<Row> {
        if self.alt_active {
            &mut self.alt_grid
        } else {
            &mut self.grid
        }
    }

    /// The visible screen as plain text, one trimmed string per row.
    pub fn display(&self) -> Vec<String> {
        self.active_grid()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|c| c.ch)
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .collect()
    }

    /// Resize the logical screen, preserving content insofar as it fits.
    ///
    /// When the height shrinks, rows are pushed off the top (primary screen:
    /// into scrollback) so the bottom of the screen — where the prompt lives
    /// — survives.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = usize::from(cols.max(1));
        let rows = usize::from(rows.max(1));
        if cols == self.cols && rows == self.rows {
            return;
        }

        // Height on the primary grid: overflow rows scroll into history.
        while self.grid.len() > rows {
            let line = self.grid.remove(0);
            self.push_scrollback(line);
            self.cursor_y = self.cursor_y.saturating_sub(1);
        }
        while self.grid.len() < rows {
            self.grid.push(blank_row(self.cols));
        }
        // The alternate grid just truncates or pads.
        self.alt_grid.truncate(rows);
        while self.alt_grid.len() < rows {
            self.alt_grid.push(blank_row(self.cols));
        }

        for row in self.grid.iter_mut().chain(self.alt_grid.iter_mut()) {
            row.resize(cols, Cell::default());
        }
        for row in &mut self.scrollback {
            row.resize(cols.max(row.len()), Cell::default());
        }

        self.cols = cols;
        self.rows = rows;
        self.scroll_top = 0;
        self.scroll_bottom = rows - 1;
        self.cursor_x = self.cursor_x.min(cols - 1);
        self.cursor_y = self.cursor_y.min(rows - 1);
        self.pending_wrap = false;
    }

    fn push_scrollback(&mut self, line: Row) {
        if self.scrollback_limit == 0 {
            return;
        }
        if self.scrollback.len() >= self.scrollback_limit {
            self.scrollback.pop_front();
        }
        self.scrollback.push_back(line);
    }

    /// Scroll the region up by `n`, top lines leaving through scrollback when
    /// the region starts at the real top of the primary screen.
    fn scroll_up(&mut self, n: usize) {
        let top = self.scroll_top;
        let bottom = self.scroll_bottom;
        let n = n.clamp(1, bottom - top + 1);
        let cols = self.cols;
        let to_history = !self.alt_active && top == 0;
        for _ in 0..n {
            let line = {
                let grid = self.active_grid_mut();
                let line = grid.remove(top);
                grid.insert(bottom, blank_row(cols));
                line
            };
            if to_history {
                self.push_scrollback(line);
            }
        }
    }

    fn scroll_down(&mut self, n: usize) {
        let top = self.scroll_top;
        let bottom = self.scroll_bottom;
        let n = n.clamp(1, bottom - top + 1);
        let cols = self.cols;
        let grid = self.active_grid_mut();
        for _ in 0..n {
            grid.remove(bottom);
            grid.insert(top, blank_row(cols));
        }
    }

    fn linefeed(&mut self) {
        self.pending_wrap = false;
        if self.cursor_y == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor_y + 1 < self.rows {
            self.cursor_y += 1;
        }
    }

    fn reverse_linefeed(&mut self) {
        self.pending_wrap = false;
        if self.cursor_y == self.scroll_top {
            self.scroll_down(1);
        } else {
            self.cursor_y = self.cursor_y.saturating_sub(1);
        }
    }

    fn put_char(&mut self, c: char) {
        if self.pending_wrap {
            self.cursor_x = 0;
            self.linefeed();
        }
        let (x, y) = (self.cursor_x, self.cursor_y);
        let style = self.style;
        let grid = self.active_grid_mut();
        grid[y][x] = Cell { ch: c, style };
        if self.cursor_x + 1 < self.cols {
            self.cursor_x += 1;
        } else {
            self.pending_wrap = true;
        }
    }

    fn move_to(&mut self, x: usize, y: usize) {
        self.cursor_x = x.min(self.cols - 1);
        self.cursor_y = y.min(self.rows - 1);
        self.pending_wrap = false;
    }

    fn erase_row_span(&mut self, y: usize, from: usize, to: usize) {
        let grid = self.active_grid_mut();
        for cell in &mut grid[y][from..to] {
            *cell = Cell::default();
        }
    }

    fn erase_in_display(&mut self, mode: u16) {
        match mode {
            // Cursor to end of screen.
            0 => {
                self.erase_row_span(self.cursor_y, self.cursor_x, self.cols);
                for y in self.cursor_y + 1..self.rows {
                    self.erase_row_span(y, 0, self.cols);
                }
            }
            // Start of screen to cursor.
            1 => {
                for y in 0..self.cursor_y {
                    self.erase_row_span(y, 0, self.cols);
                }
                self.erase_row_span(self.cursor_y, 0, self.cursor_x + 1);
            }
            // Whole screen; 3 also drops scrollback.
            2 | 3 => {
                for y in 0..self.rows {
                    self.erase_row_span(y, 0, self.cols);
                }
                if mode == 3 && !self.alt_active {
                    self.scrollback.clear();
                }
            }
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        match mode {
            0 => self.erase_row_span(self.cursor_y, self.cursor_x, self.cols),
            1 => self.erase_row_span(self.cursor_y, 0, self.cursor_x + 1),
            2 => self.erase_row_span(self.cursor_y, 0, self.cols),
            _ => {}
        }
    }

    fn insert_lines(&mut self, n: usize) {
        if self.cursor_y < self.scroll_top || self.cursor_y > self.scroll_bottom {
            return;
        }
        let bottom = self.scroll_bottom;
        let y = self.cursor_y;
        let n = n.clamp(1, bottom - y + 1);
        let cols = self.cols;
        let grid = self.active_grid_mut();
        for _ in 0..n {
            grid.remove(bottom);
            grid.insert(y, blank_row(cols));
        }
    }

    fn delete_lines(&mut self, n: usize) {
        if self.cursor_y < self.scroll_top || self.cursor_y > self.scroll_bottom {
            return;
        }
        let bottom = self.scroll_bottom;
        let y = self.cursor_y;
        let n = n.clamp(1, bottom - y + 1);
        let cols = self.cols;
        let grid = self.active_grid_mut();
        for _ in 0..n {
            grid.remove(y);
            grid.insert(bottom, blank_row(cols));
        }
    }

    fn delete_chars(&mut self, n: usize) {
        let (x, y) = (self.cursor_x, self.cursor_y);
        let cols = self.cols;
        let n = n.clamp(1, cols - x);
        let grid = self.active_grid_mut();
        let row = &mut grid[y];
        row.drain(x..x + n);
        row.resize(cols, Cell::default());
    }

    fn insert_chars(&mut self, n: usize) {
        let (x, y) = (self.cursor_x, self.cursor_y);
        let cols = self.cols;
        let n = n.clamp(1, cols - x);
        let grid = self.active_grid_mut();
        let row = &mut grid[y];
        for _ in 0..n {
            row.insert(x, Cell::default());
        }
        row.truncate(cols);
    }

    fn erase_chars(&mut self, n: usize) {
        let end = (self.cursor_x + n.max(1)).min(self.cols);
        self.erase_row_span(self.cursor_y, self.cursor_x, end);
    }

    fn enter_alt_screen(&mut self, save_cursor: bool) {
        if self.alt_active {
            return;
        }
        if save_cursor {
            self.primary_saved_cursor = (self.cursor_x, self.cursor_y);
        }
        self.alt_active = true;
        self.alt_grid = (0..self.rows).map(|_| blank_row(self.cols)).collect();
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.pending_wrap = false;
    }

    fn leave_alt_screen(&mut self, restore_cursor: bool) {
        if !self.alt_active {
            return;
        }
        self.alt_active = false;
        if restore_cursor {
            let (x, y) = self.primary_saved_cursor;
            self.move_to(x, y);
        }
        self.pending_wrap = false;
    }

    fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let top = usize::from(top.saturating_sub(1));
        let bottom = if bottom == 0 {
            self.rows - 1
        } else {
            usize::from(bottom - 1).min(self.rows - 1)
        };
        if top < bottom {
            self.scroll_top = top;
            self.scroll_bottom = bottom;
            self.move_to(0, 0);
        }
    }

    fn apply_sgr(&mut self, params: &Params) {
        // Flatten so that both `38;5;n` (separate params) and `38:5:n`
        // (colon sub-params) walk the same list.
        let flat: Vec<u16> = params.iter().flatten().copied().collect();
        if flat.is_empty() {
            self.style = Style::default();
            return;
        }
        let mut i = 0;
        while i < flat.len() {
            match flat[i] {
                0 => self.style = Style::default(),
                1 => self.style.bold = true,
                3 => self.style.italic = true,
                4 => self.style.underline = true,
                7 => self.style.reverse = true,
                9 => self.style.strike = true,
                22 => self.style.bold = false,
                23 => self.style.italic = false,
                24 => self.style.underline = false,
                27 => self.style.reverse = false,
                29 => self.style.strike = false,
                30..=37 => self.style.fg = Color::Indexed((flat[i] - 30) as u8),
                39 => self.style.fg = Color::Default,
                40..=47 => self.style.bg = Color::Indexed((flat[i] - 40) as u8),
                49 => self.style.bg = Color::Default,
                90..=97 => self.style.fg = Color::Indexed((flat[i] - 90 + 8) as u8),
                100..=107 => self.style.bg = Color::Indexed((flat[i] - 100 + 8) as u8),
                38 | 48 => {
                    let is_fg = flat[i] == 38;
                    let color = match flat.get(i + 1) {
                        Some(&5) => {
                            let c = flat.get(i + 2).map(|&v| Color::Indexed(v as u8));
                            i += 2;
                            c
                        }
                        Some(&2) => {
                            let c = match (flat.get(i + 2), flat.get(i + 3), flat.get(i + 4)) {
                                (Some(&r), Some(&g), Some(&b)) => {
                                    Some(Color::Rgb(r as u8, g as u8, b as u8))
                                }
                                _ => None,
                            };
                            i += 4;
                            c
                        }
                        _ => None,
                    };
                    if let Some(color) = color {
                        if is_fg {
                            self.style.fg = color;
                        } else {
                            self.style.bg = color;
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    // --- snapshot rendering ---

    /// Render the screen to ANSI bytes that reproduce it on a fresh terminal
    /// of the same size.
    ///
    /// Layout: scrollback lines first (each + CRLF, so the receiving
    /// terminal's own scrollback absorbs them), then the visible rows each
    /// addressed absolutely — writing rows with implicit newlines would
    /// scroll the receiving terminal and corrupt its state — and finally the
    /// live cursor position.
    pub fn render_to_ansi(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("\x1b[0m");

        for line in &self.scrollback {
            render_cells(&mut out, trim_trailing_blanks(line));
            out.push_str("\r\n");
        }

        out.push_str("\x1b[H");
        for (i, row) in self.active_grid().iter().enumerate() {
            let _ = write!(out, "\x1b[{};1H", i + 1);
            render_cells(&mut out, row);
        }

        let _ = write!(out, "\x1b[{};{}H", self.cursor_y + 1, self.cursor_x + 1);
        if !self.cursor_visible {
            out.push_str("\x1b[?25l");
        }
        out.into_bytes()
    }
}

fn trim_trailing_blanks(row: &[Cell]) -> &[Cell] {
    let end = row
        .iter()
        .rposition(|c| !c.is_blank())
        .map_or(0, |idx| idx + 1);
    &row[..end]
}

/// Append a run of cells, emitting SGR transitions only where the style
/// changes, and a reset at the end of the run if anything was styled.
fn render_cells(out: &mut String, cells: &[Cell]) {
    let mut current = Style::default();
    for cell in cells {
        if cell.style != current {
            push_sgr(out, cell.style);
            current = cell.style;
        }
        out.push(cell.ch);
    }
    if !current.is_default() {
        out.push_str("\x1b[0m");
    }
}

fn push_sgr(out: &mut String, style: Style) {
    out.push_str("\x1b[0");
    if style.bold {
        out.push_str(";1");
    }
    if style.italic {
        out.push_str(";3");
    }
    if style.underline {
        out.push_str(";4");
    }
    if style.reverse {
        out.push_str(";7");
    }
    if style.strike {
        out.push_str(";9");
    }
    match style.fg {
        Color::Default => {}
        Color::Indexed(n) => {
            let _ = write!(out, ";38;5;{n}");
        }
        Color::Rgb(r, g, b) => {
            let _ = write!(out, ";38;2;{r};{g};{b}");
        }
    }
    match style.bg {
        Color::Default => {}
        Color::Indexed(n) => {
            let _ = write!(out, ";48;5;{n}");
        }
        Color::Rgb(r, g, b) => {
            let _ = write!(out, ";48;2;{r};{g};{b}");
        }
    }
    out.push('m');
}

/// First sub-parameter of the nth parameter, with a default for 0/missing.
fn param(params: &Params, idx: usize, default: u16) -> u16 {
    params
        .iter()
        .nth(idx)
        .and_then(|p| p.first().copied())
        .filter(|&v| v != 0)
        .unwrap_or(default)
}

impl Perform for Screen {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => {
                self.cursor_x = self.cursor_x.saturating_sub(1);
                self.pending_wrap = false;
            }
            0x09 => {
                let next_stop = (self.cursor_x / 8 + 1) * 8;
                self.cursor_x = next_stop.min(self.cols - 1);
            }
            0x0A | 0x0B | 0x0C => self.linefeed(),
            0x0D => {
                self.cursor_x = 0;
                self.pending_wrap = false;
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        let private = intermediates.first() == Some(&b'?');
        match action {
            'A' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(self.cursor_x, self.cursor_y.saturating_sub(n));
            }
            'B' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(self.cursor_x, self.cursor_y + n);
            }
            'C' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(self.cursor_x + n, self.cursor_y);
            }
            'D' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(self.cursor_x.saturating_sub(n), self.cursor_y);
            }
            'E' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(0, self.cursor_y + n);
            }
            'F' => {
                let n = usize::from(param(params, 0, 1));
                self.move_to(0, self.cursor_y.saturating_sub(n));
            }
            'G' | '`' => {
                let col = usize::from(param(params, 0, 1)) - 1;
                self.move_to(col, self.cursor_y);
            }
            'H' | 'f' => {
                let row = usize::from(param(params, 0, 1)) - 1;
                let col = usize::from(param(params, 1, 1)) - 1;
                self.move_to(col, row);
            }
            'd' => {
                let row = usize::from(param(params, 0, 1)) - 1;
                self.move_to(self.cursor_x, row);
            }
            'J' => self.erase_in_display(param(params, 0, 0)),
            'K' => self.erase_in_line(param(params, 0, 0)),
            'L' => self.insert_lines(usize::from(param(params, 0, 1))),
            'M' => self.delete_lines(usize::from(param(params, 0, 1))),
            'P' => self.delete_chars(usize::from(param(params, 0, 1))),
            '@' => self.insert_chars(usize::from(param(params, 0, 1))),
            'X' => self.erase_chars(usize::from(param(params, 0, 1))),
            'S' => self.scroll_up(usize::from(param(params, 0, 1))),
            'T' => self.scroll_down(usize::from(param(params, 0, 1))),
            'm' => self.apply_sgr(params),
            'r' => {
                let top = param(params, 0, 1);
                let bottom = param(params, 1, self.rows as u16);
                self.set_scroll_region(top, bottom);
            }
            's' => self.saved_cursor = (self.cursor_x, self.cursor_y),
            'u' => {
                let (x, y) = self.saved_cursor;
                self.move_to(x, y);
            }
            'h' if private => match param(params, 0, 0) {
                25 => self.cursor_visible = true,
                47 | 1047 => self.enter_alt_screen(false),
                1049 => self.enter_alt_screen(true),
                _ => {}
            },
            'l' if private => match param(params, 0, 0) {
                25 => self.cursor_visible = false,
                47 | 1047 => self.leave_alt_screen(false),
                1049 => self.leave_alt_screen(true),
                _ => {}
            },
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        if !intermediates.is_empty() {
            return;
        }
        match byte {
            b'7' => self.saved_cursor = (self.cursor_x, self.cursor_y),
            b'8' => {
                let (x, y) = self.saved_cursor;
                self.move_to(x, y);
            }
            b'D' => self.linefeed(),
            b'E' => {
                self.cursor_x = 0;
                self.linefeed();
            }
            b'M' => self.reverse_linefeed(),
            b'c' => {
                let (cols, rows) = (self.cols, self.rows);
                *self = Screen::new(cols as u16, rows as u16, self.scrollback_limit);
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}
}
