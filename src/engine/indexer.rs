//! 索引阶段
//!
//! 列出查询下的全部条目生成清单，计算字节与条目总量。索引可以整体
//! 重跑：被打断的任务直接回退到 Queued 重新列一遍，相对复制成本可
//! 以忽略。

use crate::engine::manager::ArchiveManager;
use crate::engine::worker::StageClaim;
use crate::job::{ArchiveQuery, EntryCheckpoint, EntryKind};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::debug;

impl ArchiveManager {
    pub(crate) async fn do_indexing(&self, claim: &StageClaim) -> Result<()> {
        debug!("+ 索引任务 {}", claim.job_id);

        match &claim.desc.query {
            ArchiveQuery::Subtree(query) => {
                let entries = self
                    .sources
                    .subtree
                    .list(query)
                    .await
                    .context("列出源条目失败")?;
                if claim.token.is_cancelled() {
                    anyhow::bail!("索引已取消");
                }

                let mut manifest = BTreeMap::new();
                let mut bytes_total = 0u64;
                for entry in entries {
                    if entry.kind.has_bytes() {
                        bytes_total += entry.size_bytes;
                    }
                    manifest.insert(
                        entry.path.clone(),
                        EntryCheckpoint::new(entry.kind, entry.size_bytes),
                    );
                }
                let items_total = manifest.len() as u64;
                debug!(
                    "任务 {} 索引完成: {} 个条目, {} 字节",
                    claim.job_id, items_total, bytes_total
                );

                let mut inner = self.inner.lock().await;
                if let Some(job) = inner.history.jobs.get_mut(&claim.job_id) {
                    job.manifest = manifest;
                    job.bytes_total = bytes_total;
                    job.items_total = items_total;
                    inner.dirty = true;
                }
            }
            ArchiveQuery::Conversations(query) => {
                let convs = self
                    .sources
                    .conversations
                    .resolve(query)
                    .await
                    .context("解析会话查询失败")?;
                if claim.token.is_cancelled() {
                    anyhow::bail!("索引已取消");
                }

                let mut manifest = BTreeMap::new();
                let mut items_total = 0u64;
                for conv in &convs {
                    items_total += conv.messages_estimate;
                    manifest.insert(
                        conv.name.clone(),
                        EntryCheckpoint::new(EntryKind::Directory, 0),
                    );
                    // 预建每个会话的暂存目录
                    let conv_dir = claim.desc.target_dir().join(&conv.name);
                    tokio::fs::create_dir_all(&conv_dir)
                        .await
                        .with_context(|| format!("创建会话目录失败: {:?}", conv_dir))?;
                }
                debug!(
                    "任务 {} 索引完成: {} 个会话, 约 {} 条消息",
                    claim.job_id,
                    convs.len(),
                    items_total
                );

                let mut inner = self.inner.lock().await;
                if let Some(job) = inner.history.jobs.get_mut(&claim.job_id) {
                    job.manifest = manifest;
                    job.items_total = items_total;
                    // 会话检查点保留，恢复的任务继续沿用
                    inner.dirty = true;
                }
            }
        }

        Ok(())
    }
}
