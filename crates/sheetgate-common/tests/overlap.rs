use proptest::prelude::*;
use sheetgate_common::GridRange;

fn range_on(sheet_id: u32) -> impl Strategy<Value = GridRange> {
    (0u32..40, 0u32..12, 0u32..15, 0u32..6).prop_map(move |(r, c, h, w)| GridRange {
        sheet_id,
        start_row: r,
        start_col: c,
        end_row: r + h,
        end_col: c + w,
    })
}

fn cells(range: &GridRange) -> impl Iterator<Item = (u32, u32)> + '_ {
    (range.start_row..=range.end_row)
        .flat_map(move |r| (range.start_col..=range.end_col).map(move |c| (r, c)))
}

proptest! {
    #[test]
    fn intersects_iff_a_cell_is_shared(a in range_on(0), b in range_on(0)) {
        let shared = cells(&a).any(|(r, c)| b.contains_cell(r, c));
        prop_assert_eq!(a.intersects(&b), shared);
        prop_assert_eq!(a.intersects(&b), b.intersects(&a));
    }

    #[test]
    fn intersection_is_contained_in_both(a in range_on(0), b in range_on(0)) {
        match a.intersection(&b) {
            Some(i) => {
                prop_assert!(a.contains(&i));
                prop_assert!(b.contains(&i));
                prop_assert_eq!(Some(i), b.intersection(&a));
            }
            None => prop_assert!(!a.intersects(&b)),
        }
    }

    #[test]
    fn different_sheets_never_intersect(a in range_on(0), b in range_on(1)) {
        prop_assert!(!a.intersects(&b));
        prop_assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn tiles_cover_exactly_both_parts(a in range_on(0), b in range_on(0)) {
        if let Some(t) = a.tile_with(&b) {
            prop_assert!(!a.intersects(&b));
            prop_assert_eq!(t.cell_count(), a.cell_count() + b.cell_count());
            prop_assert!(t.contains(&a) && t.contains(&b));
        }
    }
}

#[test]
fn side_by_side_blocks_do_not_overlap() {
    let left = GridRange::new(0, 0, 0, 9, 1).unwrap();
    let right = GridRange::new(0, 0, 3, 9, 4).unwrap();
    let write = GridRange::new(0, 2, 1, 7, 2).unwrap();
    assert!(write.intersects(&left));
    assert!(!write.intersects(&right));
    assert!(!left.intersects(&right));
}
