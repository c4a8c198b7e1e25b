use serde::{Deserialize, Serialize};

/// 清单条目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// 待复制
    ToDo,
    /// 复制中
    InProgress,
    /// 已完成
    Complete,
    /// 已跳过（如无法解析的符号链接）
    Skipped,
}

/// 清单条目类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// 普通文件
    File,
    /// 目录
    Directory,
    /// 符号链接
    Symlink,
    /// 可执行文件
    Executable,
}

impl EntryKind {
    /// 是否按文件字节复制（计入 bytesTotal）
    pub fn has_bytes(&self) -> bool {
        matches!(self, EntryKind::File | EntryKind::Executable)
    }
}

/// 条目级检查点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryCheckpoint {
    /// 条目状态
    pub state: EntryState,
    /// 条目类型
    pub kind: EntryKind,
    /// 源文件大小
    pub size_bytes: u64,
    /// 最终字节的 SHA-256（十六进制，文件完成时填充）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_hex: Option<String>,
}

impl EntryCheckpoint {
    pub fn new(kind: EntryKind, size_bytes: u64) -> Self {
        Self {
            state: EntryState::ToDo,
            kind,
            size_bytes,
            hash_hex: None,
        }
    }
}

/// 分页游标（对核心不透明，由内容源解释）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCursor {
    /// 前向翻页令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// 后向翻页令牌（检查点保存前会被清除，强制只向前翻页）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    /// 每页消息数
    pub num: usize,
    /// 源报告的终止标志
    pub last: bool,
}

/// 会话级检查点（分页归档变体）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvCheckpoint {
    /// 分页游标
    pub cursor: PageCursor,
    /// 每页大小（任务内固定）
    pub page_size: usize,
    /// 恢复时将会话文件截断并定位到的偏移
    pub byte_offset: u64,
}

impl ConvCheckpoint {
    pub fn new(page_size: usize) -> Self {
        Self {
            cursor: PageCursor {
                next: None,
                previous: None,
                num: page_size,
                last: false,
            },
            page_size,
            byte_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_checkpoint_creation() {
        let cp = EntryCheckpoint::new(EntryKind::File, 1024);
        assert_eq!(cp.state, EntryState::ToDo);
        assert_eq!(cp.kind, EntryKind::File);
        assert_eq!(cp.size_bytes, 1024);
        assert!(cp.hash_hex.is_none());
    }

    #[test]
    fn test_entry_kind_has_bytes() {
        assert!(EntryKind::File.has_bytes());
        assert!(EntryKind::Executable.has_bytes());
        assert!(!EntryKind::Directory.has_bytes());
        assert!(!EntryKind::Symlink.has_bytes());
    }

    #[test]
    fn test_conv_checkpoint_creation() {
        let cp = ConvCheckpoint::new(300);
        assert_eq!(cp.page_size, 300);
        assert_eq!(cp.byte_offset, 0);
        assert_eq!(cp.cursor.num, 300);
        assert!(!cp.cursor.last);
        assert!(cp.cursor.next.is_none());
    }

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = PageCursor {
            next: Some("tok-2".to_string()),
            previous: None,
            num: 999,
            last: false,
        };
        let json = serde_json::to_string(&cursor).unwrap();
        // previous 为 None 时不应出现在编码结果里
        assert!(!json.contains("previous"));
        let parsed: PageCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cursor);
    }
}
