//! 复制阶段（字节级可续传）
//!
//! 按清单字典序逐条目复制。普通文件以 64KB 块流式复制并计算滚动
//! SHA-256；目标已存在时从其长度处续传，续传后完整重读两侧校验，
//! 不一致则回退进度从头复制。每个块边界检查取消令牌。

use crate::config::COPY_CHUNK_SIZE;
use crate::engine::manager::ArchiveManager;
use crate::engine::worker::StageClaim;
use crate::job::{ArchiveQuery, EntryKind, EntryState, SubtreeQuery};
use crate::source::EntryReader;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl ArchiveManager {
    pub(crate) async fn do_copying(self: &Arc<Self>, claim: &StageClaim) -> Result<()> {
        debug!("+ 复制任务 {}", claim.job_id);
        match claim.desc.query.clone() {
            ArchiveQuery::Subtree(query) => self.copy_subtree(claim, &query).await,
            ArchiveQuery::Conversations(query) => {
                self.archive_conversations(claim, &query).await
            }
        }
    }

    /// 子树复制：目录 / 符号链接 / 普通文件
    async fn copy_subtree(&self, claim: &StageClaim, query: &SubtreeQuery) -> Result<()> {
        let dst_base = claim.desc.target_dir();

        // BTreeMap 迭代即字典序，复制顺序确定
        let entry_paths: Vec<String> = {
            let inner = self.inner.lock().await;
            match inner.history.jobs.get(&claim.job_id) {
                Some(job) => job.manifest.keys().cloned().collect(),
                None => return Ok(()),
            }
        };

        for path in entry_paths {
            if claim.token.is_cancelled() {
                anyhow::bail!("复制已取消");
            }

            let entry = {
                let inner = self.inner.lock().await;
                inner
                    .history
                    .jobs
                    .get(&claim.job_id)
                    .and_then(|job| job.manifest.get(&path).cloned())
            };
            let Some(entry) = entry else { continue };
            // 已完成 / 已跳过的条目不再碰，暂停恢复后从第一个未完成条目继续
            if matches!(entry.state, EntryState::Complete | EntryState::Skipped) {
                continue;
            }

            self.update_manifest_entry(&claim.job_id, &path, |e| {
                e.state = EntryState::InProgress;
            })
            .await;

            let local_path = dst_base.join(&path);
            let meta = self
                .sources
                .subtree
                .stat(query, &path)
                .await
                .with_context(|| format!("读取条目元数据失败: {}", path))?;

            match entry.kind {
                EntryKind::Directory => {
                    tokio::fs::create_dir_all(&local_path)
                        .await
                        .with_context(|| format!("创建目录失败: {:?}", local_path))?;
                    set_unix_mode(&local_path, 0o755).await?;
                    set_mtime(&local_path, meta.mtime_ms)
                        .with_context(|| format!("设置目录修改时间失败: {:?}", local_path))?;
                    self.mark_entry_finished(&claim.job_id, &path, EntryState::Complete, None)
                        .await;
                }
                EntryKind::Symlink => {
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("创建父目录失败: {:?}", parent))?;
                    }
                    // 跟随链接解析一次，拒绝逃逸出任务根的链接
                    if let Err(e) = self.sources.subtree.stat_follow(query, &path).await {
                        warn!("跳过符号链接 {}: 解析失败: {}", path, e);
                        self.mark_entry_finished(
                            &claim.job_id,
                            &path,
                            EntryState::Skipped,
                            None,
                        )
                        .await;
                        continue;
                    }
                    let target = self
                        .sources
                        .subtree
                        .link_target(query, &path)
                        .await
                        .with_context(|| format!("读取链接目标失败: {}", path))?;
                    // 上次中断可能已建过链接，先清掉再按目标原样创建
                    match tokio::fs::remove_file(&local_path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("清理旧链接失败: {:?}", local_path))
                        }
                    }
                    tokio::fs::symlink(&target, &local_path)
                        .await
                        .with_context(|| format!("创建符号链接失败: {:?}", local_path))?;
                    self.mark_entry_finished(&claim.job_id, &path, EntryState::Complete, None)
                        .await;
                }
                EntryKind::File | EntryKind::Executable => {
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("创建父目录失败: {:?}", parent))?;
                    }
                    let mode = if entry.kind == EntryKind::Executable {
                        0o755
                    } else {
                        0o644
                    };

                    let dst_len = match tokio::fs::symlink_metadata(&local_path).await {
                        Ok(m) => m.len(),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("读取目标文件失败: {:?}", local_path))
                        }
                    };

                    let hash_hex = if dst_len == 0 {
                        self.copy_entry_fresh(claim, query, &path, &local_path, mode)
                            .await?
                    } else {
                        self.copy_entry_resume(claim, query, &path, &local_path, mode, dst_len)
                            .await?
                    };

                    set_mtime(&local_path, meta.mtime_ms)
                        .with_context(|| format!("设置文件修改时间失败: {:?}", local_path))?;
                    self.mark_entry_finished(
                        &claim.job_id,
                        &path,
                        EntryState::Complete,
                        Some(hash_hex),
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    /// 从字节 0 完整复制，边复制边计算 SHA-256
    async fn copy_entry_fresh(
        &self,
        claim: &StageClaim,
        query: &SubtreeQuery,
        path: &str,
        local_path: &Path,
        mode: u32,
    ) -> Result<String> {
        debug!("+ 全量复制 {}", path);
        let mut src = self
            .sources
            .subtree
            .open(query, path, 0)
            .await
            .with_context(|| format!("打开源条目失败: {}", path))?;

        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(mode);
        let mut dst = opts
            .open(local_path)
            .await
            .with_context(|| format!("创建目标文件失败: {:?}", local_path))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            if claim.token.is_cancelled() {
                anyhow::bail!("复制已取消");
            }
            let n = src.read(&mut buf).await.context("读取源数据失败")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dst.write_all(&buf[..n]).await.context("写入目标文件失败")?;
            self.add_bytes_copied(&claim.job_id, n as i64).await;
        }
        dst.flush().await.context("刷写目标文件失败")?;

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// 从目标现有长度处续传，之后完整重读两侧校验
    ///
    /// 校验不一致说明上次中断留下的字节已损坏：回退进度并从头复制。
    async fn copy_entry_resume(
        &self,
        claim: &StageClaim,
        query: &SubtreeQuery,
        path: &str,
        local_path: &Path,
        mode: u32,
        dst_len: u64,
    ) -> Result<String> {
        debug!("+ 续传复制 {} (已有 {} 字节)", path, dst_len);
        {
            let mut src = self
                .sources
                .subtree
                .open(query, path, dst_len)
                .await
                .with_context(|| format!("打开源条目失败: {}", path))?;
            let mut dst = tokio::fs::OpenOptions::new()
                .append(true)
                .open(local_path)
                .await
                .with_context(|| format!("打开目标文件失败: {:?}", local_path))?;

            let mut buf = vec![0u8; COPY_CHUNK_SIZE];
            loop {
                if claim.token.is_cancelled() {
                    anyhow::bail!("复制已取消");
                }
                let n = src.read(&mut buf).await.context("读取源数据失败")?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n]).await.context("写入目标文件失败")?;
                self.add_bytes_copied(&claim.job_id, n as i64).await;
            }
            dst.flush().await.context("刷写目标文件失败")?;
        }

        // 续传无法沿用滚动哈希，重读两侧各算一遍
        let src_reader = self
            .sources
            .subtree
            .open(query, path, 0)
            .await
            .with_context(|| format!("打开源条目失败: {}", path))?;
        let src_hash = hash_reader(&claim.token, src_reader).await?;
        let dst_hash = hash_local_file(&claim.token, local_path).await?;

        if src_hash != dst_hash {
            info!("检测到续传文件损坏，从头复制: {}", path);
            let discarded = tokio::fs::metadata(local_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            self.add_bytes_copied(&claim.job_id, -(discarded as i64)).await;
            return self
                .copy_entry_fresh(claim, query, path, local_path, mode)
                .await;
        }

        Ok(src_hash)
    }

    /// 标记条目收尾状态并推进条目计数
    pub(crate) async fn mark_entry_finished(
        &self,
        job_id: &str,
        path: &str,
        state: EntryState,
        hash_hex: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            let known = match job.manifest.get_mut(path) {
                Some(entry) => {
                    entry.state = state;
                    entry.hash_hex = hash_hex;
                    true
                }
                None => false,
            };
            if known {
                job.items_done += 1;
                inner.dirty = true;
            }
        }
    }
}

/// 流式计算 SHA-256（带取消检查）
pub(crate) async fn hash_reader(
    token: &CancellationToken,
    mut reader: EntryReader,
) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        if token.is_cancelled() {
            anyhow::bail!("校验已取消");
        }
        let n = reader.read(&mut buf).await.context("读取校验数据失败")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算本地文件的 SHA-256（带取消检查）
pub(crate) async fn hash_local_file(
    token: &CancellationToken,
    path: &Path,
) -> Result<String> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("打开文件失败: {:?}", path))?;
    hash_reader(token, Box::new(file)).await
}

/// 设置 unix 权限位
async fn set_unix_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("设置权限失败: {:?}", path))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// 把源条目的修改时间带到目标
fn set_mtime(path: &Path, mtime_ms: i64) -> std::io::Result<()> {
    if mtime_ms <= 0 {
        return Ok(());
    }
    let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_millis(mtime_ms as u64);
    std::fs::File::open(path)?.set_modified(mtime)
}
