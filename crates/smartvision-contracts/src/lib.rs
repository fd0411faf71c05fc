pub mod errors;
pub mod events;
pub mod request;
pub mod runs;
pub mod stats;
pub mod tasks;

pub use errors::{CommitError, FatalError, ItemError, ParseError};
pub use events::{Emitter, EventSink, LogLevel, PipelineEvent};
pub use request::{BatchRequest, CommitStrategy};
pub use stats::{BatchStats, CommitOutcome};
pub use tasks::{DescriptionResult, ImageTask, KeywordPolicy};
