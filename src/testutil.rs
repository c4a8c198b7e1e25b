//! 测试工具：内存内容源、纯文本渲染器、快节奏配置

use crate::config::ArchiveConfig;
use crate::engine::{ArchiveManager, ArchiveSources};
use crate::job::{ConversationQuery, EntryKind, JobPhase, PageCursor, SubtreeQuery};
use crate::persistence::{HistoryStore, MemoryStore};
use crate::source::{
    ArchivedMessage, AttachmentRef, ConversationInfo, ConversationSource, ConversationView,
    EntryReader, MessagePage, MessageRenderer, SourceEntry, SubtreeSource,
};
use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 测试用快节奏配置
pub(crate) fn fast_config() -> ArchiveConfig {
    ArchiveConfig {
        flush_interval: Duration::from_millis(50),
        resume_jobs_delay: Duration::from_millis(50),
        error_retry_delay: Duration::from_millis(100),
        retry_scan_interval: Duration::from_millis(30),
        ..ArchiveConfig::default()
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// 构造使用内存存储和快节奏配置的引擎
pub(crate) fn test_manager(source: MemSubtree) -> Arc<ArchiveManager> {
    test_manager_with(Arc::new(MemoryStore::new()), source, fast_config())
}

pub(crate) fn test_manager_with(
    store: Arc<dyn HistoryStore>,
    source: MemSubtree,
    config: ArchiveConfig,
) -> Arc<ArchiveManager> {
    ArchiveManager::new(
        config,
        store,
        ArchiveSources {
            subtree: Arc::new(source),
            conversations: Arc::new(MemConversations::empty()),
            renderer: Arc::new(PlainRenderer),
        },
    )
}

/// 轮询等待任务进入指定阶段，超时 panic
pub(crate) async fn wait_for_phase(
    mgr: &Arc<ArchiveManager>,
    job_id: &str,
    phase: JobPhase,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        if let Ok(job) = mgr.get(job_id).await {
            if job.phase == phase {
                return;
            }
            last = Some(job.phase);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "任务 {} 未在 {:?} 内到达 {:?}，最后观察到 {:?}",
        job_id, timeout, phase, last
    );
}

// ============================================================================
// 内存子树源
// ============================================================================

#[derive(Clone)]
pub(crate) enum MemEntry {
    File { data: Vec<u8>, exec: bool },
    Dir,
    Link { target: String, broken: bool },
}

/// 内存中的子树内容源，支持按路径注入打开失败
#[derive(Clone, Default)]
pub(crate) struct MemSubtree {
    entries: BTreeMap<String, MemEntry>,
    /// path → 剩余失败次数（跨 clone 共享）
    open_failures: Arc<Mutex<HashMap<String, u32>>>,
    op_delay: Duration,
}

impl MemSubtree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.entries.insert(
            path.to_string(),
            MemEntry::File {
                data: data.to_vec(),
                exec: false,
            },
        );
        self
    }

    pub fn with_exec(mut self, path: &str, data: &[u8]) -> Self {
        self.entries.insert(
            path.to_string(),
            MemEntry::File {
                data: data.to_vec(),
                exec: true,
            },
        );
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.entries.insert(path.to_string(), MemEntry::Dir);
        self
    }

    pub fn with_link(mut self, path: &str, target: &str) -> Self {
        self.entries.insert(
            path.to_string(),
            MemEntry::Link {
                target: target.to_string(),
                broken: false,
            },
        );
        self
    }

    /// 解析会失败的符号链接（模拟逃逸出根的链接）
    pub fn with_broken_link(mut self, path: &str, target: &str) -> Self {
        self.entries.insert(
            path.to_string(),
            MemEntry::Link {
                target: target.to_string(),
                broken: true,
            },
        );
        self
    }

    /// 前 n 次打开指定条目时返回 I/O 错误
    pub fn with_open_failures(self, path: &str, n: u32) -> Self {
        self.open_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), n);
        self
    }

    /// 每次源操作前的延迟，给暂停测试留窗口
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    fn entry(&self, path: &str) -> Result<&MemEntry> {
        self.entries
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("条目不存在: {}", path))
    }

    fn source_entry(&self, path: &str, entry: &MemEntry) -> SourceEntry {
        let (kind, size) = match entry {
            MemEntry::File { data, exec } => (
                if *exec {
                    EntryKind::Executable
                } else {
                    EntryKind::File
                },
                data.len() as u64,
            ),
            MemEntry::Dir => (EntryKind::Directory, 0),
            MemEntry::Link { .. } => (EntryKind::Symlink, 0),
        };
        SourceEntry {
            path: path.to_string(),
            kind,
            size_bytes: size,
            mtime_ms: 1_600_000_000_000,
        }
    }

    async fn delay(&self) {
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
    }
}

#[async_trait]
impl SubtreeSource for MemSubtree {
    async fn list(&self, _query: &SubtreeQuery) -> Result<Vec<SourceEntry>> {
        self.delay().await;
        Ok(self
            .entries
            .iter()
            .map(|(path, entry)| self.source_entry(path, entry))
            .collect())
    }

    async fn stat(&self, _query: &SubtreeQuery, path: &str) -> Result<SourceEntry> {
        self.delay().await;
        let entry = self.entry(path)?;
        Ok(self.source_entry(path, entry))
    }

    async fn stat_follow(&self, _query: &SubtreeQuery, path: &str) -> Result<()> {
        match self.entry(path)? {
            MemEntry::Link { broken: true, .. } => {
                anyhow::bail!("符号链接解析失败: {}", path)
            }
            _ => Ok(()),
        }
    }

    async fn link_target(&self, _query: &SubtreeQuery, path: &str) -> Result<String> {
        match self.entry(path)? {
            MemEntry::Link { target, .. } => Ok(target.clone()),
            _ => anyhow::bail!("不是符号链接: {}", path),
        }
    }

    async fn open(&self, _query: &SubtreeQuery, path: &str, offset: u64) -> Result<EntryReader> {
        self.delay().await;
        {
            let mut failures = self.open_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("注入的 I/O 错误: {}", path);
                }
            }
        }
        match self.entry(path)? {
            MemEntry::File { data, .. } => {
                let start = (offset as usize).min(data.len());
                Ok(Box::new(std::io::Cursor::new(data[start..].to_vec())))
            }
            _ => anyhow::bail!("不是普通文件: {}", path),
        }
    }
}

// ============================================================================
// 内存会话源
// ============================================================================

#[derive(Clone)]
struct ConvFixture {
    info: ConversationInfo,
    /// 页序列；页内为时间升序，由归档器倒序
    pages: Vec<Vec<ArchivedMessage>>,
}

#[derive(Clone, Default)]
pub(crate) struct MemConversations {
    convs: Vec<ConvFixture>,
}

impl MemConversations {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 单会话双页夹具：4 条消息，最后一条带附件
    pub fn two_page_fixture() -> Self {
        let msg = |id: u64, text: &str, attachment: Option<&str>| ArchivedMessage {
            msg_id: id,
            ctime_ms: 1_700_000_000_000 + id as i64 * 1000,
            sender: "alice".to_string(),
            text: text.to_string(),
            attachment: attachment.map(|f| AttachmentRef {
                filename: f.to_string(),
            }),
        };
        Self {
            convs: vec![ConvFixture {
                info: ConversationInfo {
                    conv_id: "conv-1".to_string(),
                    name: "general".to_string(),
                    messages_estimate: 4,
                },
                // 第一页是最新的两条，翻页向更早的消息走
                pages: vec![
                    vec![msg(3, "msg-3", None), msg(4, "msg-4", Some("photo.jpg"))],
                    vec![msg(1, "msg-1", None), msg(2, "msg-2", None)],
                ],
            }],
        }
    }
}

#[async_trait]
impl ConversationSource for MemConversations {
    async fn resolve(&self, _query: &ConversationQuery) -> Result<Vec<ConversationInfo>> {
        Ok(self.convs.iter().map(|c| c.info.clone()).collect())
    }

    async fn pull_page(&self, conv_id: &str, cursor: &PageCursor) -> Result<MessagePage> {
        let conv = self
            .convs
            .iter()
            .find(|c| c.info.conv_id == conv_id)
            .ok_or_else(|| anyhow::anyhow!("会话不存在: {}", conv_id))?;

        let index: usize = match cursor.next.as_deref() {
            Some(token) => token.parse()?,
            None => 0,
        };
        let messages = conv
            .pages
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("页越界: {}", index))?;
        let at_end = index + 1 >= conv.pages.len();
        Ok(MessagePage {
            messages,
            cursor: PageCursor {
                next: if at_end {
                    None
                } else {
                    Some((index + 1).to_string())
                },
                previous: Some(index.to_string()),
                num: cursor.num,
                last: at_end,
            },
        })
    }

    async fn download_attachment(&self, _conv_id: &str, msg_id: u64, dest: &Path) -> Result<()> {
        tokio::fs::write(dest, format!("attachment-{}", msg_id)).await?;
        Ok(())
    }
}

// ============================================================================
// 纯文本渲染器
// ============================================================================

pub(crate) struct PlainRenderer;

impl MessageRenderer for PlainRenderer {
    fn render(
        &self,
        view: &ConversationView<'_>,
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        if !view.skip_headline {
            writeln!(out, "=== {} ===", view.conversation.name)?;
        }
        for msg in view.messages {
            let ts = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(msg.ctime_ms)
                .unwrap_or_default()
                .format("%Y-%m-%d %H:%M:%S");
            writeln!(out, "[{}] {}: {}", ts, msg.sender, msg.text)?;
        }
        Ok(())
    }
}
