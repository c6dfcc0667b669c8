//! Task decomposition and parallel sub-agent scheduling

pub mod decomposer;
pub mod scheduler;

pub use decomposer::{parse_decomposition, DecomposeError, SubtaskDefinition, TaskDecomposer};
pub use scheduler::{
    AgentSubtaskRunner, ProgressCallback, SchedulerConfig, SubAgentScheduler, SubtaskResult,
    SubtaskRunner, SubtaskState, SubtaskStatus,
};
