//! 事件模块
//!
//! 任务进度与生命周期事件，经 broadcast 总线推送给订阅者。
//! 进度事件在每个 64KB 块 / 每页消息边界发出，允许丢失。

use crate::job::JobPhase;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// 归档任务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ArchiveEvent {
    /// 阶段变更
    PhaseChanged {
        job_id: String,
        old_phase: JobPhase,
        new_phase: JobPhase,
    },
    /// 进度更新（子树任务为字节，会话任务为消息数）
    Progress {
        job_id: String,
        done: u64,
        total: u64,
    },
    /// 任务完成
    Completed { job_id: String },
    /// 任务失败
    Failed { job_id: String, error: String },
}

impl ArchiveEvent {
    /// 获取任务 ID
    pub fn job_id(&self) -> &str {
        match self {
            ArchiveEvent::PhaseChanged { job_id, .. } => job_id,
            ArchiveEvent::Progress { job_id, .. } => job_id,
            ArchiveEvent::Completed { job_id } => job_id,
            ArchiveEvent::Failed { job_id, .. } => job_id,
        }
    }
}

/// 事件总线
///
/// 订阅者跟不上时丢弃最旧的事件，不阻塞工作协程。
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ArchiveEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.tx.subscribe()
    }

    /// 发布事件（没有订阅者时静默丢弃）
    pub fn publish(&self, event: ArchiveEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
