//! Cell and style types underlying the framebuffer.

/// A foreground or background color slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    /// 16/256-color palette index (0-255).
    Indexed(u8),
    /// 24-bit truecolor.
    Rgb(u8, u8, u8),
}

/// Accumulated SGR attribute state. Equality-comparable so the renderer can
/// detect a style transition between adjacent cells with a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub reverse: bool,
    pub fg: Color,
    pub bg: Color,
}

impl Style {
    pub fn reset() -> Self {
        Self::default()
    }

    /// Render this style as a single SGR escape sequence expressing the full
    /// accumulated state (a reset followed by the active attributes), so that
    /// emitting it always yields exactly one escape per transition regardless
    /// of what the previous style was.
    pub fn to_escape(&self) -> String {
        let mut parts = vec!["0".to_string()];
        if self.bold {
            parts.push("1".to_string());
        }
        if self.dim {
            parts.push("2".to_string());
        }
        if self.italic {
            parts.push("3".to_string());
        }
        if self.underline {
            parts.push("4".to_string());
        }
        if self.reverse {
            parts.push("7".to_string());
        }
        match self.fg {
            Color::Default => {}
            Color::Indexed(n) if n < 8 => parts.push((30 + n as u32).to_string()),
            Color::Indexed(n) if n < 16 => parts.push((90 + (n - 8) as u32).to_string()),
            Color::Indexed(n) => {
                parts.push("38".to_string());
                parts.push("5".to_string());
                parts.push(n.to_string());
            }
            Color::Rgb(r, g, b) => {
                parts.push("38".to_string());
                parts.push("2".to_string());
                parts.push(r.to_string());
                parts.push(g.to_string());
                parts.push(b.to_string());
            }
        }
        match self.bg {
            Color::Default => {}
            Color::Indexed(n) if n < 8 => parts.push((40 + n as u32).to_string()),
            Color::Indexed(n) if n < 16 => parts.push((100 + (n - 8) as u32).to_string()),
            Color::Indexed(n) => {
                parts.push("48".to_string());
                parts.push("5".to_string());
                parts.push(n.to_string());
            }
            Color::Rgb(r, g, b) => {
                parts.push("48".to_string());
                parts.push("2".to_string());
                parts.push(r.to_string());
                parts.push(g.to_string());
                parts.push(b.to_string());
            }
        }
        format!("\x1b[{}m", parts.join(";"))
    }

    /// Style with reverse-video forced on, used to render the cursor cell.
    /// Forced rather than toggled: the cursor is always shown inverted,
    /// independent of whatever the cell's own style already says about reverse.
    pub fn inverted(&self) -> Self {
        Self {
            reverse: true,
            ..*self
        }
    }
}

/// A single terminal cell: one codepoint plus the style active when it was written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub style: Style,
}

impl Cell {
    pub const fn blank() -> Self {
        Self {
            ch: ' ',
            style: Style {
                bold: false,
                dim: false,
                italic: false,
                underline: false,
                reverse: false,
                fg: Color::Default,
                bg: Color::Default,
            },
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank()
    }
}
