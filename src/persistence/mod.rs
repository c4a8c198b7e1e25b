//! 持久化模块
//!
//! 整个注册表快照作为单个文档整体读写。核心通过 [`HistoryStore`]
//! 访问存储，加密包装器可以套在该边界外侧；核心不关心落盘编码。

use crate::job::JobState;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// 任务历史快照（jobID → 任务状态）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobHistory {
    pub jobs: HashMap<String, JobState>,
}

/// 任务历史存储
///
/// `load` 返回 `None` 表示存储中尚无快照（视作空历史）。
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> Result<Option<JobHistory>>;
    fn save(&self, history: &JobHistory) -> Result<()>;
}

/// gzip 压缩的 JSON 文件存储
pub struct JsonGzFileStore {
    path: PathBuf,
}

impl JsonGzFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl HistoryStore for JsonGzFileStore {
    fn load(&self) -> Result<Option<JobHistory>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("打开状态文件失败: {:?}", self.path)),
        };
        let reader = GzDecoder::new(file);
        let history: JobHistory =
            serde_json::from_reader(reader).context("解码状态文件失败")?;
        Ok(Some(history))
    }

    fn save(&self, history: &JobHistory) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("创建状态目录失败: {:?}", parent))?;
        }
        let file =
            File::create(&self.path).context(format!("创建状态文件失败: {:?}", self.path))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, history).context("编码状态文件失败")?;
        encoder.finish().context("写入状态文件失败")?;
        debug!("任务历史已写入: {:?} ({} 个任务)", self.path, history.jobs.len());
        Ok(())
    }
}

/// 内存存储（测试用）
///
/// 快照编码为字节后整体保存，存储侧不解释内容。
#[derive(Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> Result<Option<JobHistory>> {
        let blob = self.blob.lock().unwrap();
        match blob.as_ref() {
            Some(bytes) => {
                let history = serde_json::from_slice(bytes).context("解码内存快照失败")?;
                Ok(Some(history))
            }
            None => Ok(None),
        }
    }

    fn save(&self, history: &JobHistory) -> Result<()> {
        let bytes = serde_json::to_vec(history).context("编码内存快照失败")?;
        *self.blob.lock().unwrap() = Some(bytes);
        Ok(())
    }
}
