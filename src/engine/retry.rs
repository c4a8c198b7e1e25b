//! 错误重试工作协程
//!
//! 每 5 秒扫描错误重试表，把到期任务从 Error 回退到出错前的就绪
//! 阶段并唤醒所有阶段协程。阶段异常的记录只告警不动。

use crate::engine::manager::ArchiveManager;
use crate::events::ArchiveEvent;
use crate::job::JobPhase;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl ArchiveManager {
    pub(crate) async fn retry_worker(self: Arc<Self>, shutdown: CancellationToken) {
        debug!(
            "错误重试协程已启动，扫描间隔 {:?}",
            self.config.retry_scan_interval
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("错误重试协程退出");
                    return;
                }
                _ = tokio::time::sleep(self.config.retry_scan_interval) => {}
            }

            let mut resumed = false;
            {
                let mut inner = self.inner.lock().await;
                let now = chrono::Utc::now().timestamp_millis();
                let due: Vec<String> = inner
                    .errors
                    .iter()
                    .filter(|(_, err)| err.next_retry_at <= now)
                    .map(|(job_id, _)| job_id.clone())
                    .collect();

                for job_id in due {
                    match inner.history.jobs.get_mut(&job_id) {
                        Some(job) if job.phase == JobPhase::Error => {
                            let back = job.resume_phase.take().unwrap_or(JobPhase::Queued);
                            debug!("重试任务 {}: Error -> {:?}", job_id, back);
                            job.phase = back;
                            inner.errors.remove(&job_id);
                            inner.dirty = true;
                            resumed = true;
                            self.events.publish(ArchiveEvent::PhaseChanged {
                                job_id,
                                old_phase: JobPhase::Error,
                                new_phase: back,
                            });
                        }
                        Some(job) => {
                            // 有错误记录但阶段对不上，留给人查
                            warn!(
                                "任务 {} 有错误记录但阶段异常: {:?}",
                                job_id, job.phase
                            );
                        }
                        None => {
                            warn!("任务 {} 有错误记录但已不存在，清除", job_id);
                            inner.errors.remove(&job_id);
                        }
                    }
                }
            }

            if resumed {
                self.pulse_all();
            }
        }
    }
}
