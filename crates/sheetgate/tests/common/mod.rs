#![allow(dead_code)]

use sheetgate::{GateConfig, Intent, IntentOp, RangeSpec, RenderMode, SheetGate};
use sheetgate_testkit::{InMemorySheets, MemorySnapshots, ObjectBuilder, ints, row};
use std::sync::Arc;

pub const OBJECT: &str = "budget";

/// `Data`: 100 x 10, header row then integer rows `r*10 + c`.
/// `Notes`: 20 x 4, empty.
pub fn fixture() -> InMemorySheets {
    let mut builder = ObjectBuilder::new(OBJECT)
        .sheet("Data", 100, 10)
        .sheet("Notes", 20, 4)
        .row("Data", 0, row(&["Id", "Name", "Cost", "Qty"]));
    for r in 1..20u32 {
        let values: Vec<i64> = (0..10).map(|c| i64::from(r * 10 + c)).collect();
        builder = builder.row("Data", r, ints(&values));
    }
    let sheets = InMemorySheets::new();
    sheets.insert(builder.build());
    sheets
}

pub fn gate_with(sheets: &InMemorySheets, config: GateConfig) -> (SheetGate, MemorySnapshots) {
    let snapshots = MemorySnapshots::new(sheets.clone());
    let gate = SheetGate::new(
        Arc::new(sheets.clone()),
        Arc::new(snapshots.clone()),
        config,
    )
    .expect("valid config");
    (gate, snapshots)
}

pub fn gate(sheets: &InMemorySheets) -> (SheetGate, MemorySnapshots) {
    gate_with(sheets, GateConfig::default())
}

pub fn read(a1: &str) -> Intent {
    Intent::read(OBJECT, RangeSpec::a1(a1))
}

pub fn read_raw(a1: &str) -> Intent {
    Intent::new(
        OBJECT,
        RangeSpec::a1(a1),
        IntentOp::ReadValues {
            render: RenderMode::Unformatted,
        },
    )
}
