//! 阶段工作协程
//!
//! 每个阶段一个协程，消费自己的合并唤醒信号：认领一个处于就绪阶段
//! 的任务并原子推进到工作阶段，执行，成功则推进到完成阶段并唤醒下
//! 一阶段，出错则记入错误重试表。认领是唯一的任务归属判定点，保证
//! 同一任务同一时刻至多一个执行器。

use crate::engine::manager::{ArchiveManager, RunningHandle};
use crate::events::ArchiveEvent;
use crate::job::{JobDescriptor, JobPhase};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Indexing,
    Copying,
    Packaging,
}

impl Stage {
    /// 认领条件：处于该就绪阶段的任务
    pub fn eligible(&self) -> JobPhase {
        match self {
            Stage::Indexing => JobPhase::Queued,
            Stage::Copying => JobPhase::Indexed,
            Stage::Packaging => JobPhase::Copied,
        }
    }

    /// 认领后进入的工作阶段
    pub fn working(&self) -> JobPhase {
        match self {
            Stage::Indexing => JobPhase::Indexing,
            Stage::Copying => JobPhase::Copying,
            Stage::Packaging => JobPhase::Packaging,
        }
    }

    /// 成功后进入的完成阶段
    pub fn completed(&self) -> JobPhase {
        match self {
            Stage::Indexing => JobPhase::Indexed,
            Stage::Copying => JobPhase::Copied,
            Stage::Packaging => JobPhase::Done,
        }
    }

    /// 本阶段完成后需要唤醒的下一阶段
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Indexing => Some(Stage::Copying),
            Stage::Copying => Some(Stage::Packaging),
            Stage::Packaging => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Indexing => "索引",
            Stage::Copying => "复制",
            Stage::Packaging => "打包",
        }
    }
}

/// 一次成功的认领
pub(crate) struct StageClaim {
    pub job_id: String,
    pub desc: JobDescriptor,
    pub claim_id: u64,
    pub token: CancellationToken,
    pub drained: Arc<Notify>,
}

/// 阶段工作协程主循环
pub(crate) async fn stage_worker(
    mgr: Arc<ArchiveManager>,
    stage: Stage,
    mut signal: crate::engine::signal::SignalReceiver,
    shutdown: CancellationToken,
) {
    debug!("{}工作协程已启动", stage.name());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("{}工作协程退出", stage.name());
                return;
            }
            alive = signal.wait() => {
                if !alive {
                    debug!("{}信号通道已关闭，工作协程退出", stage.name());
                    return;
                }
            }
        }

        let Some(claim) = mgr.claim_stage_job(stage).await else {
            continue;
        };
        // 拿到任务后给自己补一个信号，下一轮继续检查同阶段的其他任务
        mgr.pulse_stage(stage);

        debug!("{}: {}", stage.name(), claim.job_id);
        let result = match stage {
            Stage::Indexing => mgr.do_indexing(&claim).await,
            Stage::Copying => mgr.do_copying(&claim).await,
            Stage::Packaging => mgr.do_packaging(&claim).await,
        };
        mgr.finish_stage_job(stage, &claim, result).await;
    }
}

impl ArchiveManager {
    /// 认领一个处于就绪阶段的任务并推进到工作阶段
    ///
    /// 单个锁区间内完成选取、阶段改写和取消句柄登记。
    pub(crate) async fn claim_stage_job(&self, stage: Stage) -> Option<StageClaim> {
        let mut inner = self.inner.lock().await;
        if !inner.inited {
            return None;
        }

        let job_id = inner
            .history
            .jobs
            .iter()
            .find(|(_, job)| job.phase == stage.eligible())
            .map(|(id, _)| id.clone())?;

        let token = self.child_token();
        let claim_id = self.next_claim_id();
        let drained = Arc::new(Notify::new());

        let job = inner.history.jobs.get_mut(&job_id).unwrap();
        let old = job.phase;
        job.phase = stage.working();
        let desc = job.desc.clone();
        inner.running.insert(
            job_id.clone(),
            RunningHandle {
                claim_id,
                token: token.clone(),
                drained: drained.clone(),
            },
        );
        inner.dirty = true;
        self.events.publish(ArchiveEvent::PhaseChanged {
            job_id: job_id.clone(),
            old_phase: old,
            new_phase: stage.working(),
        });

        // 认领即是阶段边界，落盘脏状态
        if let Err(e) = self.flush_locked(&mut inner) {
            warn!("认领后刷写状态失败: {}", e);
        }

        Some(StageClaim {
            job_id,
            desc,
            claim_id,
            token,
            drained,
        })
    }

    /// 阶段收尾：推进 / 记错 / 让位给取消方
    pub(crate) async fn finish_stage_job(
        &self,
        stage: Stage,
        claim: &StageClaim,
        result: anyhow::Result<()>,
    ) {
        let mut pulse_next = false;
        {
            let mut inner = self.inner.lock().await;

            // 自己的句柄还在表里才移除，避免误删恢复后新认领的句柄
            let own_handle = inner
                .running
                .get(&claim.job_id)
                .map(|h| h.claim_id == claim.claim_id)
                .unwrap_or(false);
            if own_handle {
                inner.running.remove(&claim.job_id);
            }

            if claim.token.is_cancelled() {
                // 取消路径：阶段改写交给取消方（暂停 / 后台暂停 / 删除）
                debug!("任务 {} 的{}阶段被取消", claim.job_id, stage.name());
            } else if let Some(job) = inner.history.jobs.get_mut(&claim.job_id) {
                match result {
                    Ok(()) => {
                        let old = job.phase;
                        job.phase = stage.completed();
                        job.resume_phase = None;
                        job.err_message = None;
                        inner.dirty = true;
                        debug!(
                            "任务 {} {}完成: {:?} -> {:?}",
                            claim.job_id,
                            stage.name(),
                            old,
                            stage.completed()
                        );
                        self.events.publish(ArchiveEvent::PhaseChanged {
                            job_id: claim.job_id.clone(),
                            old_phase: old,
                            new_phase: stage.completed(),
                        });
                        if stage.completed() == JobPhase::Done {
                            self.events.publish(ArchiveEvent::Completed {
                                job_id: claim.job_id.clone(),
                            });
                        }
                        pulse_next = true;
                    }
                    Err(e) => {
                        error!(
                            "任务 {} {}失败: {:#}",
                            claim.job_id,
                            stage.name(),
                            e
                        );
                        let old = job.phase;
                        job.resume_phase = Some(old.eligible_phase());
                        job.phase = JobPhase::Error;
                        job.err_message = Some(format!("{:#}", e));
                        let next_retry_at = chrono::Utc::now().timestamp_millis()
                            + self.config.error_retry_delay.as_millis() as i64;
                        inner.errors.insert(
                            claim.job_id.clone(),
                            crate::job::ErrorState {
                                message: format!("{:#}", e),
                                next_retry_at,
                            },
                        );
                        inner.dirty = true;
                        self.events.publish(ArchiveEvent::PhaseChanged {
                            job_id: claim.job_id.clone(),
                            old_phase: old,
                            new_phase: JobPhase::Error,
                        });
                        self.events.publish(ArchiveEvent::Failed {
                            job_id: claim.job_id.clone(),
                            error: format!("{:#}", e),
                        });
                    }
                }
            } else {
                warn!("任务 {} 不存在，可能已被删除", claim.job_id);
            }

            // 阶段边界落盘
            if let Err(e) = self.flush_locked(&mut inner) {
                warn!("阶段收尾刷写状态失败: {}", e);
            }
        }

        if pulse_next {
            if let Some(next) = stage.next() {
                self.pulse_stage(next);
            }
        }

        // 通知可能在等待的暂停方：执行器已静止
        claim.drained.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_phase_table() {
        assert_eq!(Stage::Indexing.eligible(), JobPhase::Queued);
        assert_eq!(Stage::Indexing.working(), JobPhase::Indexing);
        assert_eq!(Stage::Indexing.completed(), JobPhase::Indexed);

        assert_eq!(Stage::Copying.eligible(), JobPhase::Indexed);
        assert_eq!(Stage::Copying.working(), JobPhase::Copying);
        assert_eq!(Stage::Copying.completed(), JobPhase::Copied);

        assert_eq!(Stage::Packaging.eligible(), JobPhase::Copied);
        assert_eq!(Stage::Packaging.working(), JobPhase::Packaging);
        assert_eq!(Stage::Packaging.completed(), JobPhase::Done);
    }

    #[test]
    fn test_stage_chain() {
        assert_eq!(Stage::Indexing.next(), Some(Stage::Copying));
        assert_eq!(Stage::Copying.next(), Some(Stage::Packaging));
        assert_eq!(Stage::Packaging.next(), None);
    }
}
