//! 会话分页归档变体
//!
//! 把"条目"换成会话：字节由分页拉取接口产出。每个会话写入一个文本
//! 文件，恢复时截断到检查点偏移再续写；每页渲染后并行下载附件，页
//! 边界 fsync 并保存检查点。外层最多 10 个会话并行，首个错误取消
//! 其余会话。

use crate::engine::manager::ArchiveManager;
use crate::engine::worker::StageClaim;
use crate::job::{ConvCheckpoint, ConversationQuery, JobDescriptor};
use crate::source::{ArchivedMessage, ConversationInfo, ConversationView};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl ArchiveManager {
    /// 并行归档查询下的全部会话
    pub(crate) async fn archive_conversations(
        self: &Arc<Self>,
        claim: &StageClaim,
        query: &ConversationQuery,
    ) -> Result<()> {
        let convs = self
            .sources
            .conversations
            .resolve(query)
            .await
            .context("解析会话查询失败")?;

        // 首个错误取消其余会话
        let conv_token = claim.token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.conversation_parallelism));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        for conv in convs {
            if conv_token.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("会话并发信号量已关闭")?;
            let mgr = self.clone();
            let job_id = claim.job_id.clone();
            let desc = claim.desc.clone();
            let token = conv_token.clone();
            join_set.spawn(async move {
                let _permit = permit;
                mgr.archive_one_conversation(&job_id, &desc, &conv, &token).await
            });
        }

        let mut first_err = None;
        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!("会话归档子任务异常: {}", e)),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    conv_token.cancel();
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                if claim.token.is_cancelled() {
                    anyhow::bail!("归档已取消");
                }
                Ok(())
            }
        }
    }

    /// 归档单个会话：分页拉取 → 倒序渲染 → 附件下载 → 检查点
    async fn archive_one_conversation(
        self: &Arc<Self>,
        job_id: &str,
        desc: &JobDescriptor,
        conv: &ConversationInfo,
        token: &CancellationToken,
    ) -> Result<()> {
        debug!("+ 归档会话 {} ({})", conv.name, conv.conv_id);

        let page_size = self.config.page_size;
        let mut cp = {
            let inner = self.inner.lock().await;
            inner
                .history
                .jobs
                .get(job_id)
                .and_then(|job| job.checkpoints.get(&conv.conv_id).cloned())
        }
        .unwrap_or_else(|| ConvCheckpoint::new(page_size));

        let conv_dir = desc.target_dir().join(&conv.name);
        tokio::fs::create_dir_all(&conv_dir)
            .await
            .with_context(|| format!("创建会话目录失败: {:?}", conv_dir))?;
        let text_path = conv_dir.join("chat.txt");

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&text_path)
            .await
            .with_context(|| format!("打开会话文件失败: {:?}", text_path))?;
        // 截断到检查点偏移，丢掉上次中断后可能写了一半的页
        file.set_len(cp.byte_offset)
            .await
            .context("截断会话文件失败")?;
        file.seek(std::io::SeekFrom::End(0))
            .await
            .context("定位会话文件失败")?;

        let mut first_page = cp.byte_offset == 0;
        while !cp.cursor.last {
            if token.is_cancelled() {
                anyhow::bail!("归档已取消");
            }

            let page = self
                .sources
                .conversations
                .pull_page(&conv.conv_id, &cp.cursor)
                .await
                .with_context(|| format!("拉取会话 {} 消息页失败", conv.conv_id))?;

            // 原地倒序，文件内呈时间降序
            let mut msgs = page.messages;
            msgs.reverse();

            let mut rendered = Vec::new();
            let view = ConversationView {
                conversation: conv,
                messages: &msgs,
                // 头部信息只在首页渲染一次
                skip_headline: !first_page,
            };
            self.sources
                .renderer
                .render(&view, &mut rendered)
                .context("渲染消息失败")?;
            file.write_all(&rendered)
                .await
                .context("写入会话文件失败")?;

            self.download_page_attachments(&conv_dir, &conv.conv_id, &msgs, token)
                .await?;

            // 页边界：进度 → fsync → 检查点
            self.add_items_done(job_id, msgs.len() as u64, page.cursor.last)
                .await;

            cp.cursor = page.cursor;
            // 固定页大小，清除回指针，强制只向前翻页
            cp.cursor.num = page_size;
            cp.cursor.previous = None;

            file.sync_all().await.context("同步会话文件失败")?;
            cp.byte_offset = file
                .metadata()
                .await
                .context("读取会话文件大小失败")?
                .len();
            self.checkpoint_conv(job_id, &conv.conv_id, cp.clone()).await;

            first_page = false;
        }

        debug!("- 归档会话 {} 完成", conv.name);
        Ok(())
    }

    /// 并行下载一页内的附件（单会话内上限 5 个并发）
    async fn download_page_attachments(
        &self,
        conv_dir: &Path,
        conv_id: &str,
        msgs: &[ArchivedMessage],
        token: &CancellationToken,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.attachment_parallelism));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        // 同页内避免重名（时间戳 + 消息 ID + 文件名全同时加序号）
        let mut taken: HashSet<PathBuf> = HashSet::new();

        for msg in msgs {
            let Some(att) = &msg.attachment else { continue };
            if token.is_cancelled() {
                anyhow::bail!("归档已取消");
            }

            let name = attachment_file_name(msg, &att.filename);
            let dest = unique_attachment_path(conv_dir, &name, &mut taken).await;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("附件并发信号量已关闭")?;
            let source = self.sources.conversations.clone();
            let conv_id = conv_id.to_string();
            let msg_id = msg.msg_id;
            join_set.spawn(async move {
                let _permit = permit;
                source
                    .download_attachment(&conv_id, msg_id, &dest)
                    .await
                    .with_context(|| format!("下载附件失败: 消息 {}", msg_id))
            });
        }

        let mut first_err = None;
        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!("附件下载子任务异常: {}", e)),
            };
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 附件文件名：发送时间 + 消息 ID + 源文件名
fn attachment_file_name(msg: &ArchivedMessage, filename: &str) -> String {
    let ts = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(msg.ctime_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d %H.%M.%S");
    format!("{} ({}) - {}", ts, msg.msg_id, filename)
}

/// 处理文件名冲突：追加序号直到不与已占用名字或磁盘上的文件重名
async fn unique_attachment_path(
    conv_dir: &Path,
    name: &str,
    taken: &mut HashSet<PathBuf>,
) -> PathBuf {
    let mut candidate = conv_dir.join(name);
    let mut ordinal = 2;
    loop {
        let on_disk = tokio::fs::try_exists(&candidate).await.unwrap_or(false);
        if !on_disk && !taken.contains(&candidate) {
            taken.insert(candidate.clone());
            return candidate;
        }
        candidate = conv_dir.join(format!("{} ({})", name, ordinal));
        if ordinal > 10_000 {
            warn!("附件重名次数异常: {:?}", candidate);
            taken.insert(candidate.clone());
            return candidate;
        }
        ordinal += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AttachmentRef;

    fn msg_with_attachment(msg_id: u64, ctime_ms: i64, filename: &str) -> ArchivedMessage {
        ArchivedMessage {
            msg_id,
            ctime_ms,
            sender: "alice".to_string(),
            text: String::new(),
            attachment: Some(AttachmentRef {
                filename: filename.to_string(),
            }),
        }
    }

    #[test]
    fn test_attachment_file_name() {
        let msg = msg_with_attachment(42, 1_700_000_000_000, "photo.jpg");
        let name = attachment_file_name(&msg, "photo.jpg");
        assert_eq!(name, "2023-11-14 22.13.20 (42) - photo.jpg");
    }

    #[tokio::test]
    async fn test_unique_attachment_path_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let mut taken = HashSet::new();

        let first = unique_attachment_path(dir.path(), "a.jpg", &mut taken).await;
        let second = unique_attachment_path(dir.path(), "a.jpg", &mut taken).await;
        let third = unique_attachment_path(dir.path(), "a.jpg", &mut taken).await;

        assert_eq!(first, dir.path().join("a.jpg"));
        assert_eq!(second, dir.path().join("a.jpg (2)"));
        assert_eq!(third, dir.path().join("a.jpg (3)"));
    }

    #[tokio::test]
    async fn test_unique_attachment_path_respects_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"existing").unwrap();
        let mut taken = HashSet::new();

        let picked = unique_attachment_path(dir.path(), "a.jpg", &mut taken).await;
        assert_eq!(picked, dir.path().join("a.jpg (2)"));
    }
}
