//! Narrow adapter over the embedded terminal emulator. A pane feeds PTY
//! output through [`TerminalBuffer::write`]; a late-binding channel gets
//! the current screen via [`TerminalBuffer::dump`].

use alacritty_terminal::{
    Term,
    event::{Event, EventListener},
    grid::Dimensions,
    index::{Column, Line, Point},
    term::{Config, cell::Flags as CellFlags},
    vte::ansi::Processor,
};
use std::io;

use crate::protocol::Winsize;

struct TermDimensions {
    columns: usize,
    screen_lines: usize,
}

impl TermDimensions {
    fn new(columns: usize, screen_lines: usize) -> Self {
        Self {
            columns,
            screen_lines,
        }
    }
}

impl Dimensions for TermDimensions {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

#[derive(Clone, Copy, Default)]
struct EventProxy;

impl EventListener for EventProxy {
    fn send_event(&self, _event: Event) {}
}

pub struct TerminalBuffer {
    term: Term<EventProxy>,
    parser: Processor,
    size: Winsize,
}

unsafe impl Send for TerminalBuffer {}

impl TerminalBuffer {
    pub fn new(size: Winsize) -> Self {
        let dimensions =
            TermDimensions::new(size.cols.max(1) as usize, size.rows.max(1) as usize);
        let term = Term::new(Config::default(), &dimensions, EventProxy);
        Self {
            term,
            parser: Processor::new(),
            size,
        }
    }

    pub fn size(&self) -> Winsize {
        self.size
    }

    /// Dimensions track the PTY; callers resize the buffer and the PTY
    /// together.
    pub fn resize(&mut self, size: Winsize) {
        if size == self.size {
            return;
        }
        let dimensions =
            TermDimensions::new(size.cols.max(1) as usize, size.rows.max(1) as usize);
        self.term.resize(dimensions);
        self.size = size;
    }

    /// Feeds raw PTY output, escape sequences included.
    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.parser.advance(&mut self.term, *byte);
        }
    }

    /// Emits a byte stream that reproduces the visible screen when
    /// replayed into a fresh terminal of the same dimensions: clear,
    /// per-row text, cursor reposition. Read-only.
    pub fn dump<W: io::Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(b"\x1b[2J\x1b[H")?;
        let grid = self.term.grid();
        let rows = grid.screen_lines();
        let cols = grid.columns();
        let mut line = String::with_capacity(cols);
        for row in 0..rows {
            line.clear();
            for col in 0..cols {
                let cell = &grid[Point::new(Line(row as i32), Column(col))];
                if cell.flags.contains(CellFlags::WIDE_CHAR_SPACER) {
                    continue;
                }
                line.push(cell.c);
            }
            let trimmed = line.trim_end_matches(' ');
            if !trimmed.is_empty() {
                sink.write_all(format!("\x1b[{};1H", row + 1).as_bytes())?;
                sink.write_all(trimmed.as_bytes())?;
            }
        }
        let cursor = grid.cursor.point;
        sink.write_all(format!("\x1b[{};{}H", cursor.line.0 + 1, cursor.column.0 + 1).as_bytes())?;
        Ok(())
    }

    /// Convenience used by panes: the whole dump as one chunk.
    pub fn dump_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.dump(&mut out).expect("vec sink cannot fail");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(buffer: &TerminalBuffer) -> String {
        String::from_utf8_lossy(&buffer.dump_bytes()).into_owned()
    }

    #[test]
    fn plain_output_shows_up_in_dump() {
        let mut buffer = TerminalBuffer::new(Winsize { rows: 4, cols: 20 });
        buffer.write(b"hello");
        let dump = text(&buffer);
        assert!(dump.starts_with("\x1b[2J\x1b[H"));
        assert!(dump.contains("hello"));
    }

    #[test]
    fn newlines_land_on_their_own_rows() {
        let mut buffer = TerminalBuffer::new(Winsize { rows: 4, cols: 20 });
        buffer.write(b"one\r\ntwo");
        let dump = text(&buffer);
        assert!(dump.contains("\x1b[1;1Hone"));
        assert!(dump.contains("\x1b[2;1Htwo"));
    }

    #[test]
    fn dump_ends_with_cursor_position() {
        let mut buffer = TerminalBuffer::new(Winsize { rows: 4, cols: 20 });
        buffer.write(b"ab");
        let dump = text(&buffer);
        assert!(dump.ends_with("\x1b[1;3H"));
    }

    #[test]
    fn replaying_a_dump_reproduces_the_screen() {
        let size = Winsize { rows: 5, cols: 24 };
        let mut original = TerminalBuffer::new(size);
        original.write(b"hello\r\nhello\r\n");
        let dump = original.dump_bytes();

        let mut replayed = TerminalBuffer::new(size);
        replayed.write(&dump);
        assert_eq!(replayed.dump_bytes(), original.dump_bytes());
    }

    #[test]
    fn resize_is_idempotent_for_equal_sizes() {
        let mut buffer = TerminalBuffer::new(Winsize { rows: 4, cols: 20 });
        buffer.write(b"stay");
        buffer.resize(Winsize { rows: 4, cols: 20 });
        assert!(text(&buffer).contains("stay"));
        buffer.resize(Winsize { rows: 10, cols: 40 });
        assert_eq!(buffer.size(), Winsize { rows: 10, cols: 40 });
    }
}
