use crate::config::ArchiveFormat;
use crate::job::checkpoint::{ConvCheckpoint, EntryCheckpoint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use uuid::Uuid;

/// 任务阶段
///
/// 流水线沿 Queued → Indexing → Indexed → Copying → Copied → Packaging → Done
/// 单向推进；Paused / BackgroundPaused / Error 是旁路状态，通过
/// `resume_phase` 回到各自的就绪阶段。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// 排队等待索引
    Queued,
    /// 索引中
    Indexing,
    /// 索引完成，等待复制
    Indexed,
    /// 复制中
    Copying,
    /// 复制完成，等待打包
    Copied,
    /// 打包中
    Packaging,
    /// 全部完成
    Done,
    /// 用户暂停
    Paused,
    /// 进入后台时暂停
    BackgroundPaused,
    /// 出错等待重试
    Error,
}

impl JobPhase {
    /// 是否为工作阶段（有执行器持有该任务）
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            JobPhase::Indexing | JobPhase::Copying | JobPhase::Packaging
        )
    }

    /// 工作阶段对应的就绪阶段（中断 / 出错后回退的目标）
    pub fn eligible_phase(&self) -> JobPhase {
        match self {
            JobPhase::Indexing => JobPhase::Queued,
            JobPhase::Copying => JobPhase::Indexed,
            JobPhase::Packaging => JobPhase::Copied,
            other => *other,
        }
    }
}

/// 子树归档查询（虚拟文件系统路径 + 修订号）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtreeQuery {
    /// 源根路径
    pub root: String,
    /// 修订号，None 表示当前版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// 会话归档查询
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationQuery {
    /// 会话过滤表达式（由内容源解释）
    pub filter: String,
}

/// 归档查询：决定任务走子树复制路径还是会话分页路径
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveQuery {
    Subtree(SubtreeQuery),
    Conversations(ConversationQuery),
}

/// 任务描述符（创建后不可变）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    /// 任务 ID，历史记录内唯一
    pub job_id: String,
    /// 归档查询
    pub query: ArchiveQuery,
    /// 输出目录，最终归档文件为 outputPath + ".tar.gz" / ".zip"
    pub output_path: PathBuf,
    /// 暂存目录（部分状态的工作目录）
    pub staging_path: PathBuf,
    /// workspace 下的目标目录名
    pub target_name: String,
    /// 是否打包压缩；打包完成后移除暂存树
    pub compress: bool,
    /// 是否允许覆盖已存在的归档文件
    pub overwrite_final: bool,
}

impl JobDescriptor {
    pub fn new(query: ArchiveQuery, output_path: PathBuf) -> Self {
        let target_name = match &query {
            ArchiveQuery::Subtree(q) => q
                .root
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or("archive")
                .to_string(),
            ArchiveQuery::Conversations(_) => "conversations".to_string(),
        };
        Self {
            job_id: Uuid::new_v4().to_string(),
            query,
            staging_path: output_path.clone(),
            output_path,
            target_name,
            compress: false,
            overwrite_final: false,
        }
    }

    /// 暂存工作区目录
    pub fn workspace_dir(&self) -> PathBuf {
        self.staging_path.join("workspace")
    }

    /// 暂存树内的目标目录（镜像源树的根）
    pub fn target_dir(&self) -> PathBuf {
        self.workspace_dir().join(&self.target_name)
    }

    /// 最终归档文件路径
    pub fn archive_path(&self, format: ArchiveFormat) -> PathBuf {
        PathBuf::from(format!(
            "{}.{}",
            self.output_path.display(),
            format.extension()
        ))
    }
}

/// 任务状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    /// 任务描述符
    pub desc: JobDescriptor,
    /// 当前阶段
    pub phase: JobPhase,
    /// 启动时间 (Unix 毫秒)
    pub started_at: i64,
    /// 中断（暂停/出错）时记录的就绪阶段，恢复时回到该阶段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_phase: Option<JobPhase>,
    /// 清单：条目路径 → 检查点（BTreeMap 保证复制按字典序进行）
    #[serde(default)]
    pub manifest: BTreeMap<String, EntryCheckpoint>,
    /// 会话检查点：会话 ID → 检查点（仅会话归档任务使用）
    #[serde(default)]
    pub checkpoints: HashMap<String, ConvCheckpoint>,
    /// 源字节总量
    pub bytes_total: u64,
    /// 已复制字节数
    pub bytes_done: u64,
    /// 已打包字节数
    pub bytes_packaged: u64,
    /// 条目总数（会话任务为消息总数估计）
    pub items_total: u64,
    /// 已完成条目数（会话任务为已归档消息数）
    pub items_done: u64,
    /// 最后一次错误信息（仅 Error 阶段有意义）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_message: Option<String>,
}

impl JobState {
    pub fn new(desc: JobDescriptor) -> Self {
        Self {
            desc,
            phase: JobPhase::Queued,
            started_at: chrono::Utc::now().timestamp_millis(),
            resume_phase: None,
            manifest: BTreeMap::new(),
            checkpoints: HashMap::new(),
            bytes_total: 0,
            bytes_done: 0,
            bytes_packaged: 0,
            items_total: 0,
            items_done: 0,
            err_message: None,
        }
    }

    /// 计算进度百分比
    ///
    /// 子树任务按字节计，会话任务没有字节总量时按条目计
    pub fn progress(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        } else if self.items_total > 0 {
            (self.items_done as f64 / self.items_total as f64) * 100.0
        } else {
            0.0
        }
    }

    /// 进度事件携带的 (done, total)
    pub fn progress_pair(&self) -> (u64, u64) {
        if self.bytes_total > 0 {
            (self.bytes_done, self.bytes_total)
        } else {
            (self.items_done, self.items_total)
        }
    }
}

/// 错误重试状态（注册表侧表，不随任务历史持久化）
#[derive(Debug, Clone)]
pub struct ErrorState {
    /// 最后一次错误
    pub message: String,
    /// 下次重试时间 (Unix 毫秒)
    pub next_retry_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtree_desc() -> JobDescriptor {
        JobDescriptor::new(
            ArchiveQuery::Subtree(SubtreeQuery {
                root: "/team/docs".to_string(),
                revision: Some(42),
            }),
            PathBuf::from("/tmp/out"),
        )
    }

    #[test]
    fn test_descriptor_defaults() {
        let desc = subtree_desc();
        assert!(!desc.job_id.is_empty());
        assert_eq!(desc.target_name, "docs");
        assert_eq!(desc.staging_path, desc.output_path);
        assert!(!desc.compress);
        assert!(!desc.overwrite_final);
        assert_eq!(desc.workspace_dir(), PathBuf::from("/tmp/out/workspace"));
        assert_eq!(
            desc.target_dir(),
            PathBuf::from("/tmp/out/workspace/docs")
        );
        assert_eq!(
            desc.archive_path(ArchiveFormat::TarGz),
            PathBuf::from("/tmp/out.tar.gz")
        );
        assert_eq!(
            desc.archive_path(ArchiveFormat::Zip),
            PathBuf::from("/tmp/out.zip")
        );
    }

    #[test]
    fn test_phase_helpers() {
        assert!(JobPhase::Indexing.is_working());
        assert!(JobPhase::Copying.is_working());
        assert!(JobPhase::Packaging.is_working());
        assert!(!JobPhase::Queued.is_working());
        assert!(!JobPhase::Done.is_working());
        assert!(!JobPhase::Paused.is_working());

        assert_eq!(JobPhase::Indexing.eligible_phase(), JobPhase::Queued);
        assert_eq!(JobPhase::Copying.eligible_phase(), JobPhase::Indexed);
        assert_eq!(JobPhase::Packaging.eligible_phase(), JobPhase::Copied);
        // 非工作阶段原样返回
        assert_eq!(JobPhase::Done.eligible_phase(), JobPhase::Done);
    }

    #[test]
    fn test_progress_calculation() {
        let mut state = JobState::new(subtree_desc());
        assert_eq!(state.progress(), 0.0);

        state.bytes_total = 1000;
        state.bytes_done = 250;
        assert_eq!(state.progress(), 25.0);
        assert_eq!(state.progress_pair(), (250, 1000));

        // 会话任务没有字节总量时按条目计
        state.bytes_total = 0;
        state.bytes_done = 0;
        state.items_total = 40;
        state.items_done = 10;
        assert_eq!(state.progress(), 25.0);
        assert_eq!(state.progress_pair(), (10, 40));
    }

    #[test]
    fn test_state_roundtrip() {
        let mut state = JobState::new(subtree_desc());
        state.manifest.insert(
            "a.txt".to_string(),
            EntryCheckpoint::new(crate::job::EntryKind::File, 11),
        );
        let json = serde_json::to_string(&state).unwrap();
        let parsed: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
