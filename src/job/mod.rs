// 任务数据模型模块
//
// - `types.rs`: 任务描述符、任务状态、阶段状态机
// - `checkpoint.rs`: 条目级 / 会话级检查点

mod checkpoint;
mod types;

pub use checkpoint::{ConvCheckpoint, EntryCheckpoint, EntryKind, EntryState, PageCursor};
pub use types::{
    ArchiveQuery, ConversationQuery, ErrorState, JobDescriptor, JobPhase, JobState, SubtreeQuery,
};
