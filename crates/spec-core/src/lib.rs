pub mod config;
pub mod events;
pub mod prompt;
pub mod review;
pub mod types;

pub use config::{Config, ExecutorConfig, PlannerConfig, ReviewerConfig};
pub use events::{EventPayload, EventType, SpecEvent, SpecStats};
pub use review::{FixChunkSpec, ReviewVerdict};
pub use types::{
    Chunk, ChunkStatus, GitState, Id, Project, QueueItem, ReviewLog, ReviewStatus, Spec,
    SpecStatus, ToolCall, ToolCallStatus, Worker, WorkerStats, WorkerStatus,
};
