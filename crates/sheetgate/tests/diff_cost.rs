use proptest::prelude::*;
use sheetgate::{DiffConfig, DiffEngine, DiffTier, GridRange, IntentOp};

fn engine() -> DiffEngine {
    DiffEngine::new(DiffConfig {
        sample_rows: 5,
        full_threshold_cells: 40,
        full_ceiling_cells: 1_000,
        max_listed_changes: 10,
    })
}

fn planned_cost(engine: &DiffEngine, height: u32, width: u32, forced: Option<DiffTier>) -> (DiffTier, u64) {
    let affected = GridRange::new(0, 0, 0, height - 1, width - 1).unwrap();
    let estimate = engine.estimate_cells(&IntentOp::ClearValues, Some(&affected), None);
    let plan = engine.plan(&IntentOp::ClearValues, Some(affected), estimate, forced);
    (plan.tier, plan.cost())
}

proptest! {
    #[test]
    fn larger_estimates_never_cost_less(width in 1u32..30, h1 in 1u32..200, h2 in 1u32..200) {
        let engine = engine();
        let (lo, hi) = (h1.min(h2), h1.max(h2));
        let (_, small) = planned_cost(&engine, lo, width, None);
        let (_, large) = planned_cost(&engine, hi, width, None);
        prop_assert!(small <= large, "{lo}x{width} costs {small}, {hi}x{width} costs {large}");
    }

    #[test]
    fn sample_is_never_dearer_than_full(width in 1u32..30, height in 1u32..200) {
        let engine = engine();
        let (_, sample) = planned_cost(&engine, height, width, Some(DiffTier::Sample));
        let (_, full) = planned_cost(&engine, height, width, Some(DiffTier::Full));
        let (_, metadata) = planned_cost(&engine, height, width, Some(DiffTier::Metadata));
        prop_assert!(metadata <= sample && sample <= full);
    }

    #[test]
    fn metadata_operations_stay_metadata(count in 0u32..10_000) {
        let engine = engine();
        let op = IntentOp::DeleteSheet;
        prop_assert_eq!(engine.select_tier(&op, u64::from(count)), DiffTier::Metadata);
    }
}

#[test]
fn tier_switches_at_the_threshold() {
    let engine = engine();
    assert_eq!(planned_cost(&engine, 8, 5, None), (DiffTier::Full, 40));
    // 9 x 5 = 45 cells is past the threshold; the sample still reads 8 rows.
    assert_eq!(planned_cost(&engine, 9, 5, None), (DiffTier::Sample, 40));
    assert_eq!(planned_cost(&engine, 100, 5, None), (DiffTier::Sample, 40));
}
