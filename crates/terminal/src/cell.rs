//! Screen cells
//!
//! A cell is plain data: one displayed character, its column width, palette
//! indices, and two small bitmasks. Cells cross the wire inside grid
//! snapshots, so the byte layout is fixed (native byte order, local-only).

/// Bold attribute bit.
pub const ATTR_BOLD: u8 = 1 << 0;
/// Underline attribute bit.
pub const ATTR_UNDERLINE: u8 = 1 << 1;
/// Italic attribute bit.
pub const ATTR_ITALIC: u8 = 1 << 2;
/// Reverse-video attribute bit.
pub const ATTR_REVERSE: u8 = 1 << 3;

/// Set when the foreground is the terminal default rather than an index.
pub const COLOR_FG_DEFAULT: u8 = 1 << 0;
/// Set when the background is the terminal default rather than an index.
pub const COLOR_BG_DEFAULT: u8 = 1 << 1;

/// Encoded size of one cell in a snapshot: four UTF-8 bytes (zero padded)
/// plus width, fg, bg, attrs, color flags.
pub const CELL_WIRE_SIZE: usize = 9;

/// One styled display unit at a `(row, col)` position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// Displayed character. Blank cells hold a space.
    pub ch: char,
    /// Display width in columns (1, or 2 for wide characters).
    pub width: u8,
    /// Foreground palette index (meaningful unless the default flag is set).
    pub fg: u8,
    /// Background palette index (meaningful unless the default flag is set).
    pub bg: u8,
    /// `ATTR_*` bitmask.
    pub attrs: u8,
    /// `COLOR_*_DEFAULT` bitmask.
    pub color_flags: u8,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            width: 1,
            fg: 7,
            bg: 0,
            attrs: 0,
            color_flags: COLOR_FG_DEFAULT | COLOR_BG_DEFAULT,
        }
    }
}

impl Cell {
    /// A blank cell in default colors.
    pub fn blank() -> Self {
        Self::default()
    }

    /// True for cells that render as nothing: a space with no attributes in
    /// the default background.
    pub fn is_blank(&self) -> bool {
        self.ch == ' ' && self.attrs == 0 && self.color_flags & COLOR_BG_DEFAULT != 0
    }

    /// Append the 9-byte wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut utf8 = [0u8; 4];
        let encoded = self.ch.encode_utf8(&mut utf8);
        let len = encoded.len();
        let mut bytes = [0u8; 4];
        bytes[..len].copy_from_slice(&utf8[..len]);
        out.extend_from_slice(&bytes);
        out.push(self.width);
        out.push(self.fg);
        out.push(self.bg);
        out.push(self.attrs);
        out.push(self.color_flags);
    }

    /// Decode the 9-byte wire form. Undecodable character bytes fall back to
    /// a blank glyph rather than poisoning the whole snapshot.
    pub fn decode(bytes: &[u8; CELL_WIRE_SIZE]) -> Self {
        let end = bytes[..4].iter().position(|&b| b == 0).unwrap_or(4);
        let ch = std::str::from_utf8(&bytes[..end])
            .ok()
            .and_then(|s| s.chars().next())
            .unwrap_or(' ');
        Self {
            ch,
            width: bytes[4].clamp(1, 2),
            fg: bytes[5],
            bg: bytes[6],
            attrs: bytes[7],
            color_flags: bytes[8],
        }
    }
}

/// Project a true-color value onto the 216-color cube of the 256-color
/// palette.
pub fn rgb_to_cube(r: u8, g: u8, b: u8) -> u8 {
    16 + (r / 51) * 36 + (g / 51) * 6 + (b / 51)
}
