#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process OCR instance pool: admission, priority scheduling, dispatch,
//! the preprocess/recognize/postprocess pipeline and dynamic scaling.

/// Public API for the pool crate.
pub mod api;
/// Error taxonomy.
pub mod error;
/// The optional region-history capability.
pub mod history;
/// The recognition capability the pool consumes.
pub mod recognizer;
/// Deterministic recognizers for tests.
pub mod testing;

mod dispatch;
mod instance;
mod matching;
mod perflog;
mod pool;
mod ports;
mod postprocess;
mod preprocess;
mod queue;
mod scaling;
mod task;
mod worker;

pub use api::{
    EnrichedResult, ImagePayload, InstanceDetail, InstanceModelInfo, InstanceStatus,
    InstanceSummary, KeywordMatch, MatchConfig, MatchStrategy, OptimizationInfo, PoolEvent,
    PoolHandle, PoolOptions, PoolStatus, QueueDepths, Roi, ScalingAction, ScalingDecisionRecord,
    TaskHandle, TaskPriority, TaskSpec, TaskStatus, TextRegion, start_pool,
};
pub use error::{PoolError, TaskError};
pub use recognizer::{
    Decoder, RawRegion, RecognizeOptions, Recognizer, RecognizerError, RecognizerFactory,
    ResourceUsage,
};
