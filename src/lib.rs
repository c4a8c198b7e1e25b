// Archive Engine Rust Library
// 归档任务引擎核心库

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 错误类型模块
pub mod errors;

// 任务数据模型模块
pub mod job;

// 外部内容源接口模块
pub mod source;

// 持久化模块
pub mod persistence;

// 事件模块
pub mod events;

// 归档引擎模块
pub mod engine;

// 测试工具（仅测试构建）
#[cfg(test)]
pub(crate) mod testutil;

// 导出常用类型
pub use config::{ArchiveConfig, ArchiveFormat};
pub use errors::ArchiveError;
pub use events::ArchiveEvent;
pub use job::{
    ArchiveQuery, ConvCheckpoint, ConversationQuery, EntryCheckpoint, EntryKind, EntryState,
    ErrorState, JobDescriptor, JobPhase, JobState, PageCursor, SubtreeQuery,
};
pub use persistence::{HistoryStore, JobHistory, JsonGzFileStore, MemoryStore};
pub use source::{
    ArchivedMessage, AttachmentRef, ConversationInfo, ConversationSource, ConversationView,
    EntryReader, MessagePage, MessageRenderer, SourceEntry, SubtreeSource,
};

pub use engine::{ArchiveManager, ArchiveSources};
