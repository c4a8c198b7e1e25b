// 配置管理模块

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 复制与打包使用的块大小: 64KB
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// 最终归档格式（整个引擎固定一种，不按任务协商）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// gzip 压缩的 tar 包，产物为 `<outputPath>.tar.gz`
    TarGz,
    /// deflate 压缩的 zip 包，产物为 `<outputPath>.zip`
    Zip,
}

impl ArchiveFormat {
    /// 归档文件扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// 归档引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// 脏状态刷写间隔
    #[serde(with = "duration_secs", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// 启动/回到前台后，自动恢复后台暂停任务前的延迟
    #[serde(with = "duration_secs", default = "default_resume_delay")]
    pub resume_jobs_delay: Duration,
    /// 任务出错后距下次重试的间隔
    #[serde(with = "duration_secs", default = "default_retry_delay")]
    pub error_retry_delay: Duration,
    /// 错误重试扫描间隔
    #[serde(with = "duration_secs", default = "default_retry_scan")]
    pub retry_scan_interval: Duration,
    /// 会话分页大小（每个任务固定）
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 并行归档的会话数上限
    #[serde(default = "default_conversation_parallelism")]
    pub conversation_parallelism: usize,
    /// 单个会话内并行下载附件数上限
    #[serde(default = "default_attachment_parallelism")]
    pub attachment_parallelism: usize,
    /// 归档格式
    #[serde(default = "default_archive_format")]
    pub archive_format: ArchiveFormat,
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_resume_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_scan() -> Duration {
    Duration::from_secs(5)
}

fn default_page_size() -> usize {
    999
}

fn default_conversation_parallelism() -> usize {
    10
}

fn default_attachment_parallelism() -> usize {
    5
}

fn default_archive_format() -> ArchiveFormat {
    ArchiveFormat::TarGz
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            resume_jobs_delay: default_resume_delay(),
            error_retry_delay: default_retry_delay(),
            retry_scan_interval: default_retry_scan(),
            page_size: default_page_size(),
            conversation_parallelism: default_conversation_parallelism(),
            attachment_parallelism: default_attachment_parallelism(),
            archive_format: default_archive_format(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用文件日志
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志保留天数
    pub retention_days: u32,
    /// 日志级别（trace/debug/info/warn/error）
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: "info".to_string(),
        }
    }
}

/// Duration 以秒为单位做 serde 编解码
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
