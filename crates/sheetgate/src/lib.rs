//! Request compilation and safety rails for a quota-limited spreadsheet API.
//!
//! Callers submit [`Intent`]s addressed by A1 text, named ranges, sheet titles
//! or column headers. [`SheetGate`] resolves them against live structure,
//! checks them, merges them into the fewest backend calls, dispatches those
//! under rate limiting and deduplication, and keeps a rectangle-precise cache
//! of what it read. Transactions group intents into one unit that is rolled
//! back from a snapshot on failure.

pub mod backend;
pub mod cache;
pub mod cancel;
pub mod compiler;
pub mod config;
pub mod conflict;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod intent;
pub mod limiter;
pub mod pipeline;
pub mod policy;
pub mod resolver;
pub mod structure;
pub mod transaction;
pub mod window;

pub use backend::{
    BackendCall, BackendError, ReadRequest, RevisionInfo, SheetsBackend, SnapshotError, SnapshotId,
    SnapshotService, StructuralReply, StructuralRequest, ValueMutation, ValueRange,
};
pub use cache::{CacheStats, RangeCache};
pub use cancel::CancelToken;
pub use compiler::{BackendBatchRequest, BatchCompiler, QueuedIntent};
pub use config::{
    BatchConfig, CacheConfig, ConflictConfig, DedupConfig, DiffConfig, GateConfig, RateLimitConfig,
    ResolverConfig, RetryConfig, TransactionConfig,
};
pub use conflict::{ConflictVersion, checksum_grid};
pub use dedup::DedupStats;
pub use diff::{CellChange, DiffEngine, DiffPlan, DiffResult, DiffTier, MetadataDiff};
pub use error::{ConfigError, GateError, PolicyViolation, ResolutionError, ResolutionErrorKind};
pub use executor::IntentOutcome;
pub use gateway::SheetGate;
pub use intent::{
    CellFormat, Dimension, EffectScope, ExpectedState, Intent, IntentOp, OperationClass,
    OperationFamily, RangeSpec, SafetyConfig,
};
pub use limiter::{ClassLimiterStats, RateLimiterStats};
pub use policy::{DryRunPreview, PolicyEnforcer};
pub use resolver::{DuplicateHeaderPolicy, RangeResolver};
pub use structure::{LiveStructure, NamedRangeDef, SheetInfo};
pub use transaction::{TransactionId, TransactionInfo, TransactionStatus};

// Re-export for convenience
pub use sheetgate_common::{CellValue, Grid, GridRange, RenderMode, SheetId};
