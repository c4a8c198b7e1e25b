//! 引擎错误类型定义
//!
//! 注册表公开操作返回的类型化错误。工作协程内部的瞬时 I/O 错误
//! 统一走 anyhow + 错误重试表，不在这里建模。

use crate::job::JobPhase;

/// 归档引擎错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// 任务不存在
    JobNotFound(String),
    /// 任务 ID 已存在
    JobExists(String),
    /// 任务未在运行中（暂停前置条件不满足）
    NotRunning { job_id: String, phase: JobPhase },
    /// 任务不可恢复（恢复前置条件不满足）
    NotResumable { job_id: String, phase: JobPhase },
    /// 持久化存储错误（状态文件损坏等，不自动重试）
    Store(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::JobNotFound(id) => write!(f, "任务不存在: {}", id),
            ArchiveError::JobExists(id) => write!(f, "任务 ID 已存在: {}", id),
            ArchiveError::NotRunning { job_id, phase } => {
                write!(f, "任务 {} 未在运行中，当前阶段: {:?}", job_id, phase)
            }
            ArchiveError::NotResumable { job_id, phase } => {
                write!(f, "任务 {} 不可恢复，当前阶段: {:?}", job_id, phase)
            }
            ArchiveError::Store(msg) => write!(f, "持久化存储错误: {}", msg),
        }
    }
}

impl std::error::Error for ArchiveError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArchiveError::JobNotFound("j1".to_string());
        assert_eq!(err.to_string(), "任务不存在: j1");

        let err = ArchiveError::NotRunning {
            job_id: "j2".to_string(),
            phase: JobPhase::Queued,
        };
        assert!(err.to_string().contains("j2"));
        assert!(err.to_string().contains("Queued"));
    }
}
