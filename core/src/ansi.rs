//! Byte-stream to framebuffer-mutation interpreter: a small, deliberately
//! non-conformant subset of ANSI/VT100 plus SGR color handling. Never raises
//! on malformed input; unrecognized bytes and escapes are consumed
//! conservatively and the framebuffer keeps going.

use crate::cell::{Color, Style};
use crate::framebuffer::Framebuffer;

/// Bytes carried over at most this long while waiting for the rest of a
/// split escape/OSC sequence, so a slow or hostile stream can't grow the
/// carry buffer without bound.
const MAX_CARRY: usize = 8192;

enum Step {
    /// Consumed `len` bytes starting at the escape's ESC byte.
    Consumed(usize),
    /// Not enough bytes yet to know the sequence's length; caller should
    /// stash the remainder and wait for more input.
    Incomplete,
}

/// Stateful only in the sense that it remembers bytes split across chunk
/// boundaries; it holds no terminal state itself (that lives in `Framebuffer`).
#[derive(Default)]
pub struct AnsiInterpreter {
    carry: Vec<u8>,
}

impl AnsiInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of process output into the framebuffer. Returns true if
    /// a bell (BEL) byte appeared anywhere in this chunk.
    pub fn feed(&mut self, fb: &mut Framebuffer, chunk: &[u8]) -> bool {
        if self.carry.len() > MAX_CARRY {
            self.carry.clear();
        }
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut i = 0;
        let mut bell = false;
        while i < buf.len() {
            let b = buf[i];
            match b {
                0x0D => {
                    fb.carriage_return();
                    i += 1;
                }
                0x0A => {
                    fb.newline();
                    i += 1;
                }
                0x08 => {
                    fb.backspace();
                    i += 1;
                }
                0x07 => {
                    bell = true;
                    i += 1;
                }
                0x09 => {
                    fb.tab();
                    i += 1;
                }
                0x0E | 0x0F | 0x00 => {
                    i += 1;
                }
                0x1B => match self.handle_escape(fb, &buf[i..]) {
                    Step::Consumed(len) => i += len,
                    Step::Incomplete => {
                        self.carry = buf[i..].to_vec();
                        return bell;
                    }
                },
                _ if b >= 0x20 => match decode_utf8_char(&buf[i..]) {
                    Some((ch, len)) => {
                        fb.write(ch);
                        i += len;
                    }
                    None => {
                        self.carry = buf[i..].to_vec();
                        return bell;
                    }
                },
                _ => {
                    i += 1;
                }
            }
        }
        bell
    }

    fn handle_escape(&self, fb: &mut Framebuffer, rest: &[u8]) -> Step {
        if rest.len() < 2 {
            return Step::Incomplete;
        }
        match rest[1] {
            b'[' => match scan_csi(rest) {
                CsiOutcome::Complete { params, cmd, len } => {
                    apply_csi(fb, cmd, &params);
                    Step::Consumed(len)
                }
                CsiOutcome::Malformed => Step::Consumed(2),
                CsiOutcome::Incomplete => Step::Incomplete,
            },
            b']' => match scan_osc(rest) {
                OscOutcome::Complete { len } => Step::Consumed(len),
                OscOutcome::Malformed => Step::Consumed(2),
                OscOutcome::Incomplete => Step::Incomplete,
            },
            b'7' | b'8' | b'M' | b'D' | b'E' | b'H' | b'c' => Step::Consumed(2),
            _ => Step::Consumed(2),
        }
    }
}

enum CsiOutcome {
    Complete { params: Vec<i64>, cmd: u8, len: usize },
    Malformed,
    Incomplete,
}

/// `rest` starts at `ESC [`. Scans parameter bytes (digits, `;`, `?`) up to
/// the terminating letter, mirroring `\x1b\[([0-9;?]*)([a-zA-Z@])`.
fn scan_csi(rest: &[u8]) -> CsiOutcome {
    let mut j = 2;
    while j < rest.len() {
        let b = rest[j];
        if b.is_ascii_digit() || b == b';' || b == b'?' {
            j += 1;
            continue;
        }
        if b.is_ascii_alphabetic() || b == b'@' {
            let params = parse_params(&rest[2..j]);
            return CsiOutcome::Complete {
                params,
                cmd: b,
                len: j + 1,
            };
        }
        return CsiOutcome::Malformed;
    }
    CsiOutcome::Incomplete
}

fn parse_params(raw: &[u8]) -> Vec<i64> {
    let s: String = raw.iter().filter(|&&b| b != b'?').map(|&b| b as char).collect();
    if s.is_empty() {
        return Vec::new();
    }
    s.split(';').map(|p| p.parse::<i64>().unwrap_or(0)).collect()
}

enum OscOutcome {
    Complete { len: usize },
    Malformed,
    Incomplete,
}

/// `rest` starts at `ESC ]`. Terminated by BEL or `ESC \`.
fn scan_osc(rest: &[u8]) -> OscOutcome {
    let mut j = 2;
    while j < rest.len() {
        match rest[j] {
            0x07 => return OscOutcome::Complete { len: j + 1 },
            0x1B => {
                if j + 1 < rest.len() {
                    if rest[j + 1] == b'\\' {
                        return OscOutcome::Complete { len: j + 2 };
                    }
                    return OscOutcome::Malformed;
                }
                return OscOutcome::Incomplete;
            }
            _ => j += 1,
        }
    }
    OscOutcome::Incomplete
}

fn decode_utf8_char(bytes: &[u8]) -> Option<(char, usize)> {
    let first = bytes[0];
    let len = if first < 0x80 {
        1
    } else if first & 0xE0 == 0xC0 {
        2
    } else if first & 0xF0 == 0xE0 {
        3
    } else if first & 0xF8 == 0xF0 {
        4
    } else {
        // invalid leading byte; consume it as U+FFFD so a stray byte doesn't wedge the stream
        return Some(('\u{FFFD}', 1));
    };
    if bytes.len() < len {
        return None;
    }
    match std::str::from_utf8(&bytes[..len]) {
        Ok(s) => s.chars().next().map(|c| (c, len)),
        Err(_) => Some(('\u{FFFD}', 1)),
    }
}

fn param_or(params: &[i64], idx: usize, default: i64) -> i64 {
    params.get(idx).copied().filter(|&v| v != 0).unwrap_or(default)
}

fn apply_csi(fb: &mut Framebuffer, cmd: u8, params: &[i64]) {
    match cmd {
        b'A' => {
            let n = param_or(params, 0, 1).max(0) as u16;
            let (_, y) = fb.cursor();
            fb.move_cursor(None, Some(y.saturating_sub(n)));
        }
        b'B' => {
            let n = param_or(params, 0, 1).max(0) as u16;
            let (_, y) = fb.cursor();
            fb.move_cursor(None, Some((y + n).min(fb.height().saturating_sub(1))));
        }
        b'C' => {
            let n = param_or(params, 0, 1).max(0) as u16;
            let (x, _) = fb.cursor();
            fb.move_cursor(Some((x + n).min(fb.width().saturating_sub(1))), None);
        }
        b'D' => {
            let n = param_or(params, 0, 1).max(0) as u16;
            let (x, _) = fb.cursor();
            fb.move_cursor(Some(x.saturating_sub(n)), None);
        }
        b'H' | b'f' => {
            let row = params.first().copied().unwrap_or(0).max(0).saturating_sub(1).max(0) as u16;
            let col = params.get(1).copied().unwrap_or(0).max(0).saturating_sub(1).max(0) as u16;
            fb.move_cursor(Some(col), Some(row));
        }
        b'G' => {
            let col = params.first().copied().unwrap_or(0).max(0).saturating_sub(1).max(0) as u16;
            fb.move_cursor(Some(col), None);
        }
        b'd' => {
            let row = params.first().copied().unwrap_or(0).max(0).saturating_sub(1).max(0) as u16;
            fb.move_cursor(None, Some(row));
        }
        b'J' => fb.clear_screen(params.first().copied().unwrap_or(0).max(0) as u8),
        b'K' => fb.clear_line(params.first().copied().unwrap_or(0).max(0) as u8),
        b'S' => fb.scroll_up(param_or(params, 0, 1).max(0) as usize),
        b'T' => fb.scroll_down(param_or(params, 0, 1).max(0) as usize),
        b's' => fb.save_cursor(),
        b'u' => fb.restore_cursor(),
        b'@' => fb.insert_chars(param_or(params, 0, 1).max(0) as usize),
        b'P' => fb.delete_chars(param_or(params, 0, 1).max(0) as usize),
        b'L' => fb.insert_lines(param_or(params, 0, 1).max(0) as usize),
        b'M' => fb.delete_lines(param_or(params, 0, 1).max(0) as usize),
        b'r' | b'h' | b'l' => {}
        b'm' => apply_sgr(fb, params),
        _ => {}
    }
}

/// Rebuilds the active style from scratch from this escape's own parameters,
/// matching the source interpreter: style is never merged across separate
/// SGR escapes, only accumulated left to right within one.
fn apply_sgr(fb: &mut Framebuffer, params: &[i64]) {
    let params: Vec<i64> = if params.is_empty() { vec![0] } else { params.to_vec() };
    let mut style = Style::default();
    let mut i = 0;
    while i < params.len() {
        let p = params[i];
        match p {
            0 => {}
            1 => style.bold = true,
            2 => style.dim = true,
            3 => style.italic = true,
            4 => style.underline = true,
            7 => style.reverse = true,
            5 | 8 | 9 => {}
            30..=37 => style.fg = Color::Indexed((p - 30) as u8),
            39 => style.fg = Color::Default,
            40..=47 => style.bg = Color::Indexed((p - 40) as u8),
            49 => style.bg = Color::Default,
            90..=97 => style.fg = Color::Indexed(8 + (p - 90) as u8),
            100..=107 => style.bg = Color::Indexed(8 + (p - 100) as u8),
            38 => {
                if i + 2 < params.len() && params[i + 1] == 5 {
                    style.fg = Color::Indexed(params[i + 2] as u8);
                    i += 2;
                } else if i + 4 < params.len() && params[i + 1] == 2 {
                    style.fg = Color::Rgb(params[i + 2] as u8, params[i + 3] as u8, params[i + 4] as u8);
                    i += 4;
                }
            }
            48 => {
                if i + 2 < params.len() && params[i + 1] == 5 {
                    style.bg = Color::Indexed(params[i + 2] as u8);
                    i += 2;
                } else if i + 4 < params.len() && params[i + 1] == 2 {
                    style.bg = Color::Rgb(params[i + 2] as u8, params[i + 3] as u8, params[i + 4] as u8);
                    i += 4;
                }
            }
            _ => {}
        }
        i += 1;
    }
    fb.set_style(style);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_position_csi() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        ansi.feed(&mut fb, b"\x1b[2;4H");
        assert_eq!(fb.cursor(), (3, 1));
    }

    #[test]
    fn sgr_params_rebuild_each_escape() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        ansi.feed(&mut fb, b"\x1b[31mA\x1b[0mB");
        assert_eq!(fb.current_style().fg, Color::Indexed(1));
        // after the reset escape only "B" was written, using a fresh default style
        // (not merged with the prior red foreground).
        assert_eq!(fb.current_style(), Style::default());
    }

    #[test]
    fn bell_flag_set_only_when_present() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        assert!(!ansi.feed(&mut fb, b"no bell here"));
        assert!(ansi.feed(&mut fb, b"\x07"));
    }

    #[test]
    fn erase_line_mode_zero_via_csi() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        ansi.feed(&mut fb, b"abcdefghij");
        // row 1, col 6 (1-based) => cursor (5, 0) 0-based
        ansi.feed(&mut fb, b"\x1b[1;6H\x1b[K");
        assert_eq!(fb.cursor(), (5, 0));
        let rendered = fb.render(false);
        assert!(rendered[0].contains("abcde"));
    }

    #[test]
    fn split_escape_across_chunks_is_not_corrupted() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        ansi.feed(&mut fb, b"\x1b[2");
        ansi.feed(&mut fb, b";4H");
        assert_eq!(fb.cursor(), (3, 1));
    }

    #[test]
    fn split_utf8_codepoint_across_chunks() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        let bytes = "é".as_bytes().to_vec();
        ansi.feed(&mut fb, &bytes[..1]);
        ansi.feed(&mut fb, &bytes[1..]);
        let rendered = fb.render(false);
        assert!(rendered[0].contains('é'));
    }

    #[test]
    fn unrecognized_escape_consumed_conservatively() {
        let mut fb = Framebuffer::new(10, 3, 100);
        let mut ansi = AnsiInterpreter::new();
        // ESC followed by a byte that is neither '[' nor ']' nor a known single-byte form
        ansi.feed(&mut fb, b"\x1bZhello");
        let rendered = fb.render(false);
        assert!(rendered[0].contains("hello"));
    }
}
