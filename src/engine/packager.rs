//! 打包阶段（tar.gz / zip）
//!
//! 遍历暂存工作区生成单个压缩归档。目录写头部，符号链接写携带目标
//! 的链接头，普通文件流式写入并按块累计已打包字节数。归档文件默认
//! 独占创建；打包成功后移除暂存树，失败则保留半成品供检查，重试时
//! 重新生成。

use crate::config::{ArchiveFormat, COPY_CHUNK_SIZE};
use crate::engine::manager::ArchiveManager;
use crate::engine::worker::StageClaim;
use crate::events::ArchiveEvent;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

impl ArchiveManager {
    pub(crate) async fn do_packaging(self: &Arc<Self>, claim: &StageClaim) -> Result<()> {
        let desc = &claim.desc;
        if !desc.compress {
            debug!("任务 {} 未开启压缩，跳过打包", claim.job_id);
            return Ok(());
        }

        // 重试会整个重新生成归档，已打包字节数清零
        {
            let mut inner = self.inner.lock().await;
            if let Some(job) = inner.history.jobs.get_mut(&claim.job_id) {
                job.bytes_packaged = 0;
                inner.dirty = true;
            }
        }

        let workspace = desc.workspace_dir();
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("创建暂存工作区失败: {:?}", workspace))?;
        let format = self.config.archive_format;
        let out_path = desc.archive_path(format);
        let overwrite = desc.overwrite_final;
        let counter = Arc::new(AtomicU64::new(0));
        debug!("+ 打包任务 {} -> {:?}", claim.job_id, out_path);

        let mut pack_task = {
            let workspace = workspace.clone();
            let out_path = out_path.clone();
            let counter = counter.clone();
            let token = claim.token.clone();
            tokio::task::spawn_blocking(move || match format {
                ArchiveFormat::TarGz => {
                    pack_tar_gz(&workspace, &out_path, overwrite, &counter, &token)
                }
                ArchiveFormat::Zip => {
                    pack_zip(&workspace, &out_path, overwrite, &counter, &token)
                }
            })
        };

        // 打包进行中周期性同步进度
        let pack_result: Result<()> = loop {
            tokio::select! {
                joined = &mut pack_task => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(anyhow::anyhow!("打包任务异常: {}", e)),
                    };
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                    self.sync_packaged_bytes(&claim.job_id, &counter).await;
                }
            }
        };
        self.sync_packaged_bytes(&claim.job_id, &counter).await;

        // 失败时保留半成品归档供检查
        pack_result?;
        if claim.token.is_cancelled() {
            anyhow::bail!("打包已取消");
        }

        // 打包成功后尽早释放暂存空间
        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            warn!("移除暂存工作区 {:?} 失败: {}", workspace, e);
        }
        debug!("- 打包任务 {} 完成", claim.job_id);
        Ok(())
    }

    /// 把打包计数器里累积的增量并入任务状态并发进度事件
    async fn sync_packaged_bytes(&self, job_id: &str, counter: &AtomicU64) {
        let delta = counter.swap(0, Ordering::SeqCst);
        if delta == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            job.bytes_packaged += delta;
            let done = job.bytes_packaged;
            let total = job.bytes_total;
            inner.dirty = true;
            self.events.publish(ArchiveEvent::Progress {
                job_id: job_id.to_string(),
                done,
                total,
            });
        }
    }
}

/// 半成品标记文件路径
fn partial_marker_path(out_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.partial", out_path.display()))
}

/// 打开归档文件
///
/// 默认独占创建；目标已存在但留有我们自己的半成品标记时允许截断
/// 重建（上次打包失败的重试路径），否则报错不覆盖既有文件。
fn open_archive_file(out_path: &Path, overwrite: bool) -> Result<File> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建归档目录失败: {:?}", parent))?;
    }
    let marker = partial_marker_path(out_path);

    let file = if overwrite {
        File::create(out_path)
    } else {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(out_path)
        {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && marker.exists() => {
                File::create(out_path)
            }
            Err(e) => Err(e),
        }
    }
    .with_context(|| format!("创建归档文件失败: {:?}", out_path))?;

    std::fs::write(&marker, b"").with_context(|| format!("写入标记失败: {:?}", marker))?;
    Ok(file)
}

/// 打包完成，清除半成品标记
fn finish_archive_file(out_path: &Path) {
    let _ = std::fs::remove_file(partial_marker_path(out_path));
}

/// 带进度计数和取消检查的读取器（打包线程内使用）
struct ProgressReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
    token: CancellationToken,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(std::io::Error::other("打包已取消"));
        }
        let cap = buf.len().min(COPY_CHUNK_SIZE);
        let n = self.inner.read(&mut buf[..cap])?;
        self.counter.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }
}

/// 生成 gzip 压缩的 tar 归档
fn pack_tar_gz(
    workspace: &Path,
    out_path: &Path,
    overwrite: bool,
    counter: &Arc<AtomicU64>,
    token: &CancellationToken,
) -> Result<()> {
    let file = open_archive_file(out_path, overwrite)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(workspace).sort_by_file_name() {
        let entry = entry.context("遍历暂存目录失败")?;
        if entry.path() == workspace {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .context("计算相对路径失败")?;
        let meta = entry.metadata().context("读取条目元数据失败")?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut header = tar::Header::new_gnu();
        header.set_mtime(mtime);

        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder
                .append_data(&mut header, rel, std::io::empty())
                .with_context(|| format!("写入目录头失败: {:?}", rel))?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("读取链接目标失败: {:?}", entry.path()))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header
                .set_link_name(&target)
                .with_context(|| format!("设置链接目标失败: {:?}", target))?;
            builder
                .append_data(&mut header, rel, std::io::empty())
                .with_context(|| format!("写入链接头失败: {:?}", rel))?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                header.set_mode(meta.permissions().mode() & 0o7777);
            }
            #[cfg(not(unix))]
            header.set_mode(0o644);

            let src = File::open(entry.path())
                .with_context(|| format!("打开文件失败: {:?}", entry.path()))?;
            let mut reader = ProgressReader {
                inner: src,
                counter: counter.clone(),
                token: token.clone(),
            };
            builder
                .append_data(&mut header, rel, &mut reader)
                .with_context(|| format!("写入文件失败: {:?}", rel))?;
        }
    }

    let encoder = builder.into_inner().context("收尾 tar 流失败")?;
    encoder.finish().context("收尾 gzip 流失败")?;
    finish_archive_file(out_path);
    Ok(())
}

/// 生成 deflate 压缩的 zip 归档
fn pack_zip(
    workspace: &Path,
    out_path: &Path,
    overwrite: bool,
    counter: &Arc<AtomicU64>,
    token: &CancellationToken,
) -> Result<()> {
    let file = open_archive_file(out_path, overwrite)?;
    let mut writer = zip::ZipWriter::new(file);
    let base_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(workspace).sort_by_file_name() {
        let entry = entry.context("遍历暂存目录失败")?;
        if entry.path() == workspace {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .context("计算相对路径失败")?;
        let rel_name = rel.to_string_lossy().replace('\\', "/");
        let meta = entry.metadata().context("读取条目元数据失败")?;

        if meta.is_dir() {
            writer
                .add_directory(rel_name.as_str(), base_options)
                .with_context(|| format!("写入目录项失败: {}", rel_name))?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("读取链接目标失败: {:?}", entry.path()))?;
            writer
                .add_symlink(
                    rel_name.as_str(),
                    target.to_string_lossy().into_owned(),
                    base_options,
                )
                .with_context(|| format!("写入链接项失败: {}", rel_name))?;
        } else {
            let mut options = base_options;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                options = options.unix_permissions(meta.permissions().mode() & 0o7777);
            }
            writer
                .start_file(rel_name.as_str(), options)
                .with_context(|| format!("写入文件项失败: {}", rel_name))?;
            let src = File::open(entry.path())
                .with_context(|| format!("打开文件失败: {:?}", entry.path()))?;
            let mut reader = ProgressReader {
                inner: src,
                counter: counter.clone(),
                token: token.clone(),
            };
            std::io::copy(&mut reader, &mut writer)
                .with_context(|| format!("复制文件内容失败: {}", rel_name))?;
        }
    }

    writer.finish().context("收尾 zip 流失败")?;
    finish_archive_file(out_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read;

    /// 搭一个小暂存树：目录 + 文件 + 符号链接
    fn build_workspace(root: &Path) {
        let target = root.join("docs");
        std::fs::create_dir_all(target.join("sub")).unwrap();
        std::fs::write(target.join("a.txt"), b"hello world").unwrap();
        std::fs::write(target.join("sub/b.bin"), vec![9u8; 70 * 1024]).unwrap();
        std::os::unix::fs::symlink("a.txt", target.join("lnk")).unwrap();
    }

    fn idle_token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_tar_gz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.tar.gz");
        let counter = Arc::new(AtomicU64::new(0));

        pack_tar_gz(&workspace, &out, false, &counter, &idle_token()).unwrap();
        assert!(counter.load(Ordering::SeqCst) > 0);
        assert!(!partial_marker_path(&out).exists());

        // 解开验证条目
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        let mut contents: HashMap<String, Vec<u8>> = HashMap::new();
        let mut links: HashMap<String, String> = HashMap::new();
        let mut dirs = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            match entry.header().entry_type() {
                tar::EntryType::Directory => dirs.push(path),
                tar::EntryType::Symlink => {
                    let target = entry
                        .header()
                        .link_name()
                        .unwrap()
                        .unwrap()
                        .to_string_lossy()
                        .to_string();
                    links.insert(path, target);
                }
                _ => {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data).unwrap();
                    contents.insert(path, data);
                }
            }
        }

        assert!(dirs.iter().any(|d| d.trim_end_matches('/') == "docs"));
        assert_eq!(contents["docs/a.txt"], b"hello world");
        assert_eq!(contents["docs/sub/b.bin"].len(), 70 * 1024);
        assert_eq!(links["docs/lnk"], "a.txt");
    }

    #[test]
    fn test_zip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.zip");
        let counter = Arc::new(AtomicU64::new(0));

        pack_zip(&workspace, &out, false, &counter, &idle_token()).unwrap();
        assert!(counter.load(Ordering::SeqCst) > 0);

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut file = archive.by_name("docs/a.txt").unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello world");
    }

    /// 独占创建：目标已存在且不是我们的半成品时报错
    #[test]
    fn test_exclusive_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.tar.gz");
        std::fs::write(&out, b"user archive").unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let result = pack_tar_gz(&workspace, &out, false, &counter, &idle_token());
        assert!(result.is_err());
        // 既有文件原样保留
        assert_eq!(std::fs::read(&out).unwrap(), b"user archive");
    }

    /// overwrite 开启时允许覆盖
    #[test]
    fn test_overwrite_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.tar.gz");
        std::fs::write(&out, b"old archive").unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        pack_tar_gz(&workspace, &out, true, &counter, &idle_token()).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    /// 上次失败留下的半成品（带标记）在重试时被重建
    #[test]
    fn test_retry_recreates_partial_archive() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.tar.gz");

        // 模拟失败现场：半成品 + 标记
        std::fs::write(&out, b"partial garbage").unwrap();
        std::fs::write(partial_marker_path(&out), b"").unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        pack_tar_gz(&workspace, &out, false, &counter, &idle_token()).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert!(!partial_marker_path(&out).exists());
    }

    /// 取消令牌触发后打包中止，半成品保留
    #[test]
    fn test_cancellation_aborts_packing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        build_workspace(&workspace);
        let out = dir.path().join("out.tar.gz");

        let token = CancellationToken::new();
        token.cancel();
        let counter = Arc::new(AtomicU64::new(0));
        let result = pack_tar_gz(&workspace, &out, false, &counter, &token);
        assert!(result.is_err());
        assert!(out.exists(), "半成品应保留供检查");
        assert!(partial_marker_path(&out).exists());
    }
}
