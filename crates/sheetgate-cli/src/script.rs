//! Replay script format.

use serde::{Deserialize, Serialize};
use sheetgate::{GateConfig, GridRange, Intent};
use sheetgate_common::Grid;
use sheetgate_testkit::{MemoryObject, ObjectBuilder};

#[derive(Debug, Deserialize)]
pub struct Script {
    pub objects: Vec<ObjectSpec>,
    #[serde(default)]
    pub config: Option<GateConfig>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectSpec {
    pub object_id: String,
    pub sheets: Vec<SheetSpec>,
    #[serde(default)]
    pub named_ranges: Vec<NamedSpec>,
}

#[derive(Debug, Deserialize)]
pub struct SheetSpec {
    pub title: String,
    pub rows: u32,
    pub cols: u32,
    /// Initial contents anchored at A1.
    #[serde(default)]
    pub values: Option<Grid>,
}

#[derive(Debug, Deserialize)]
pub struct NamedSpec {
    pub name: String,
    pub range: GridRange,
}

impl ObjectSpec {
    pub fn build(&self) -> MemoryObject {
        let mut builder = ObjectBuilder::new(self.object_id.as_str());
        for sheet in &self.sheets {
            builder = builder.sheet(&sheet.title, sheet.rows, sheet.cols);
            if let Some(values) = &sheet.values {
                builder = builder.block(&sheet.title, 0, 0, values);
            }
        }
        for named in &self.named_ranges {
            builder = builder.named(&named.name, named.range);
        }
        builder.build()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Submit intents together so they share one batch window.
    Submit(Vec<Intent>),
    /// Run intents as one transaction.
    Transaction {
        object_id: String,
        intents: Vec<Intent>,
        /// Fail the backend's mutating call after this many have succeeded.
        #[serde(default)]
        fail_after_mutations: Option<usize>,
    },
    /// Answer the next `count` backend calls with a quota error.
    Throttle {
        count: usize,
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    Sleep { ms: u64 },
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub kind: &'static str,
    pub results: Vec<serde_json::Value>,
    pub backend_calls: usize,
}
