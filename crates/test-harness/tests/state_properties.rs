//! Property tests over the grid, ring, and snapshot codec

use proptest::prelude::*;

use terminal::cell::Cell;
use terminal::{snapshot, Grid};

fn arb_cell() -> impl Strategy<Value = Cell> {
    (
        proptest::char::range('!', '~'),
        0u8..=255,
        0u8..=255,
        0u8..16,
        0u8..4,
    )
        .prop_map(|(ch, fg, bg, attrs, color_flags)| Cell {
            ch,
            width: 1,
            fg,
            bg,
            attrs,
            color_flags,
        })
}

/// A grid with random live content and `pushes` random history rows.
fn arb_grid() -> impl Strategy<Value = Grid> {
    (1usize..8, 1usize..5, 0usize..6, 0usize..12).prop_flat_map(|(w, h, cap, pushes)| {
        (
            proptest::collection::vec(arb_cell(), w * h),
            proptest::collection::vec(proptest::collection::vec(arb_cell(), w), pushes),
            Just((w, h, cap)),
        )
            .prop_map(|(live, history, (w, h, cap))| {
                let mut grid = Grid::new(w, h, cap);
                for (i, cell) in live.into_iter().enumerate() {
                    grid.set_cell(i % w, i / w, cell);
                }
                for row in history {
                    grid.push_history(row.into_boxed_slice(), false);
                }
                grid
            })
    })
}

proptest! {
    #[test]
    fn scroll_offset_never_exceeds_stored(mut grid in arb_grid(), steps in proptest::collection::vec(0usize..20, 0..16)) {
        for (i, n) in steps.into_iter().enumerate() {
            if i % 2 == 0 {
                grid.scroll_up(n);
            } else {
                grid.scroll_down(n);
            }
            prop_assert!(grid.scroll_offset() <= grid.stored());
        }
    }

    #[test]
    fn display_line_is_total(mut grid in arb_grid(), offset in 0usize..20) {
        grid.scroll_up(offset);
        for y in 0..grid.height() {
            // Must never panic, whatever the offset.
            let _ = grid.display_line(y);
        }
    }

    #[test]
    fn ring_keeps_the_newest_rows(cap in 1usize..6, pushes in 0usize..20) {
        let mut grid = Grid::new(3, 1, cap);
        for i in 0..pushes {
            let label = char::from_u32('a' as u32 + (i % 26) as u32).unwrap();
            let row = vec![Cell { ch: label, ..Cell::default() }; 3];
            grid.push_history(row.into_boxed_slice(), false);
        }

        prop_assert_eq!(grid.history_count(), pushes as u64);
        prop_assert_eq!(grid.stored(), pushes.min(cap));

        let stored = grid.stored();
        for k in 0..stored {
            let expected_index = pushes - stored + k;
            let expected = char::from_u32('a' as u32 + (expected_index % 26) as u32).unwrap();
            prop_assert_eq!(grid.history_row(k).cells[0].ch, expected);
        }
    }

    #[test]
    fn snapshot_roundtrip_preserves_everything_observable(grid in arb_grid(), pane_id in 0u32..100) {
        let cursor = (
            (grid.width() as u16).saturating_sub(1),
            (grid.height() as u16).saturating_sub(1),
        );
        let bytes = snapshot::serialize(&grid, pane_id, cursor);
        let (id, restored_cursor, restored) = snapshot::deserialize(&bytes).unwrap();

        prop_assert_eq!(id, pane_id);
        prop_assert_eq!(restored_cursor, cursor);
        prop_assert_eq!(restored.width(), grid.width());
        prop_assert_eq!(restored.height(), grid.height());
        for y in 0..grid.height() {
            prop_assert_eq!(restored.row(y), grid.row(y));
        }

        // History comes back chronological with the count reset to what was
        // actually replayed.
        prop_assert_eq!(restored.history_count(), grid.stored() as u64);
        for k in 0..grid.stored() {
            prop_assert_eq!(&*restored.history_row(k).cells, &*grid.history_row(k).cells);
        }
    }

    #[test]
    fn reflow_preserves_nonblank_text(width in 2usize..10, new_width in 1usize..10, rows in proptest::collection::vec("[a-z]{0,9}", 0..8)) {
        let mut grid = Grid::new(width, 2, 32);
        for text in &rows {
            let mut row = vec![Cell::blank(); width];
            for (i, ch) in text.chars().take(width).enumerate() {
                row[i].ch = ch;
            }
            grid.push_history(row.into_boxed_slice(), false);
        }

        let mut before = String::new();
        for k in 0..grid.stored() {
            before.extend(grid.history_row(k).cells.iter().map(|c| c.ch).filter(|c| *c != ' '));
        }

        grid.reflow(new_width);

        let mut after = String::new();
        for k in 0..grid.stored() {
            after.extend(grid.history_row(k).cells.iter().map(|c| c.ch).filter(|c| *c != ' '));
        }

        // The ring may shed its oldest rows if the narrower width needs
        // more of them, so the surviving text is a suffix of the original.
        prop_assert!(before.ends_with(&after), "before={before:?} after={after:?}");
    }
}
