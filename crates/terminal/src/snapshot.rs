//! Grid snapshot codec
//!
//! A snapshot is what a front-end ships to the server at detach time and
//! replays on the next attach: eight native-endian u32 header words
//! (`pane_id, cx, cy, width, height, history_size, history_count,
//! scroll_offset`), the live cells, then the stored history rows oldest
//! first with the ring unwrapped. Emitter and consumer are the same binary
//! on the same machine; cross-version or cross-endian durability is a
//! non-goal.

use thiserror::Error;

use crate::cell::{Cell, CELL_WIRE_SIZE};
use crate::grid::Grid;

/// Header words in the snapshot layout.
const HEADER_WORDS: usize = 8;
const HEADER_BYTES: usize = HEADER_WORDS * 4;

/// Reject absurd geometry before multiplying it into an allocation.
const MAX_DIMENSION: u32 = 10_000;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot shorter than its header")]
    ShortHeader,

    #[error("snapshot geometry {0}x{1} is out of range")]
    BadGeometry(u32, u32),

    #[error("snapshot length {found} does not match geometry (expected {expected})")]
    LengthMismatch { expected: usize, found: usize },
}

/// Serialize `grid` with its pane id and cursor.
///
/// History rows are written at the live width: rows captured before a resize
/// are padded or truncated so every row in the blob has the same stride.
pub fn serialize(grid: &Grid, pane_id: u32, cursor: (u16, u16)) -> Vec<u8> {
    let width = grid.width();
    let height = grid.height();
    let stored = grid.stored();

    let mut out = Vec::with_capacity(HEADER_BYTES + (width * height + stored * width) * CELL_WIRE_SIZE);
    for word in [
        pane_id,
        cursor.0 as u32,
        cursor.1 as u32,
        width as u32,
        height as u32,
        grid.history_size() as u32,
        grid.history_count().min(u32::MAX as u64) as u32,
        grid.scroll_offset() as u32,
    ] {
        out.extend_from_slice(&word.to_ne_bytes());
    }

    for y in 0..height {
        for cell in grid.row(y) {
            cell.encode(&mut out);
        }
    }

    let blank = Cell::blank();
    for k in 0..stored {
        let row = grid.history_row(k);
        for x in 0..width {
            row.cells.get(x).unwrap_or(&blank).encode(&mut out);
        }
    }

    out
}

/// Rebuild a grid from snapshot bytes.
///
/// Returns the pane id, the cursor, and the grid. The rebuilt grid's
/// `history_count` equals the number of rows actually replayed, and the
/// scroll offset is clamped against it.
pub fn deserialize(bytes: &[u8]) -> Result<(u32, (u16, u16), Grid), SnapshotError> {
    if bytes.len() < HEADER_BYTES {
        return Err(SnapshotError::ShortHeader);
    }

    let mut words = [0u32; HEADER_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u32::from_ne_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    let [pane_id, cx, cy, width, height, history_size, history_count, scroll_offset] = words;

    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(SnapshotError::BadGeometry(width, height));
    }

    let width = width as usize;
    let height = height as usize;
    let stored = (history_count.min(history_size)) as usize;
    let expected = HEADER_BYTES + (width * height + stored * width) * CELL_WIRE_SIZE;
    if bytes.len() != expected {
        return Err(SnapshotError::LengthMismatch { expected, found: bytes.len() });
    }

    let mut grid = Grid::new(width, height, history_size as usize);

    let mut offset = HEADER_BYTES;
    let mut next_cell = || {
        let chunk: &[u8; CELL_WIRE_SIZE] = bytes[offset..offset + CELL_WIRE_SIZE].try_into().unwrap();
        offset += CELL_WIRE_SIZE;
        Cell::decode(chunk)
    };

    for y in 0..height {
        for x in 0..width {
            let cell = next_cell();
            grid.set_cell(x, y, cell);
        }
    }

    for _ in 0..stored {
        let mut cells = Vec::with_capacity(width);
        for _ in 0..width {
            cells.push(next_cell());
        }
        grid.push_history(cells.into_boxed_slice(), false);
    }

    grid.scroll_up((scroll_offset as usize).min(grid.stored()));

    let cursor = (
        (cx as u16).min(width.saturating_sub(1) as u16),
        (cy as u16).min(height.saturating_sub(1) as u16),
    );
    Ok((pane_id, cursor, grid))
}
