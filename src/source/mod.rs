//! 外部内容源接口
//!
//! 核心只消费三类远端能力：列出查询下的条目、从指定偏移流式读取条目
//! 字节、按游标拉取会话消息页。消息渲染是一次一页的黑盒写入。
//! 具体实现（远端拉取器、附件下载器、渲染器）由外层注入。

use crate::job::{ConversationQuery, EntryKind, PageCursor, SubtreeQuery};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncRead;

/// 索引阶段列出的源条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// 相对于查询根的路径
    pub path: String,
    /// 条目类型
    pub kind: EntryKind,
    /// 文件大小（目录与符号链接为 0）
    pub size_bytes: u64,
    /// 修改时间 (Unix 毫秒)
    pub mtime_ms: i64,
}

/// 条目字节流
pub type EntryReader = Box<dyn AsyncRead + Send + Unpin>;

/// 虚拟文件系统子树内容源
#[async_trait]
pub trait SubtreeSource: Send + Sync {
    /// 递归列出查询根下的全部条目
    async fn list(&self, query: &SubtreeQuery) -> Result<Vec<SourceEntry>>;

    /// 查询单个条目的元数据（不跟随符号链接）
    async fn stat(&self, query: &SubtreeQuery, path: &str) -> Result<SourceEntry>;

    /// 跟随符号链接解析一次，链接逃逸出查询根时返回错误
    async fn stat_follow(&self, query: &SubtreeQuery, path: &str) -> Result<()>;

    /// 读取符号链接目标（原样返回，不做解析）
    async fn link_target(&self, query: &SubtreeQuery, path: &str) -> Result<String>;

    /// 从 offset 开始流式读取条目字节
    async fn open(&self, query: &SubtreeQuery, path: &str, offset: u64) -> Result<EntryReader>;
}

/// 会话信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInfo {
    /// 会话 ID（检查点键）
    pub conv_id: String,
    /// 会话显示名（暂存目录名）
    pub name: String,
    /// 消息总数估计（进度分母）
    pub messages_estimate: u64,
}

/// 附件引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// 源文件名
    pub filename: String,
}

/// 归档消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedMessage {
    /// 消息 ID
    pub msg_id: u64,
    /// 发送时间 (Unix 毫秒)
    pub ctime_ms: i64,
    /// 发送者
    pub sender: String,
    /// 文本内容
    pub text: String,
    /// 附件（如有）
    pub attachment: Option<AttachmentRef>,
}

/// 一页消息及翻页游标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    /// 本页消息（源返回顺序，调用方负责倒序渲染）
    pub messages: Vec<ArchivedMessage>,
    /// 下一页游标（含终止标志）
    pub cursor: PageCursor,
}

/// 会话内容源（分页拉取 + 附件下载）
#[async_trait]
pub trait ConversationSource: Send + Sync {
    /// 将查询解析为会话列表
    async fn resolve(&self, query: &ConversationQuery) -> Result<Vec<ConversationInfo>>;

    /// 按游标拉取一页消息
    async fn pull_page(&self, conv_id: &str, cursor: &PageCursor) -> Result<MessagePage>;

    /// 下载附件到指定路径
    async fn download_attachment(&self, conv_id: &str, msg_id: u64, dest: &Path) -> Result<()>;
}

/// 一页消息的渲染视图
pub struct ConversationView<'a> {
    /// 所属会话
    pub conversation: &'a ConversationInfo,
    /// 已倒序的消息（时间降序）
    pub messages: &'a [ArchivedMessage],
    /// 是否跳过头部信息（首页之后为 true）
    pub skip_headline: bool,
}

/// 消息渲染器：每页调用一次，把消息写成文本
pub trait MessageRenderer: Send + Sync {
    fn render(&self, view: &ConversationView<'_>, out: &mut dyn std::io::Write)
        -> std::io::Result<()>;
}
