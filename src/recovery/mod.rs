//! 上下文恢复：跨子系统状态的快照、持久化与重建

pub mod graph;
pub mod manager;
pub mod snapshot;
pub mod store;

pub use graph::TaskGraph;
pub use manager::{
    ContextRecoveryManager, RecoveryOptions, RestorationReport, RestoredIdMap,
    RECOVERY_HOOK_PRIORITY, SCRATCH_AVAILABLE_SESSIONS, SCRATCH_SNAPSHOT_ID,
};
pub use snapshot::{
    AgentExecutionRef, CheckpointKind, ContextSnapshot, ContextState, DomainBlocks,
    RecoveryStatistics, SessionFilter, SessionSummary, SnapshotDomain, SnapshotMetadata,
    TestRunRef,
};
pub use store::{create_snapshot_store, MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
