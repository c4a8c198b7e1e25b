//! 任务注册表
//!
//! 跨进程重启持久化一组长时任务，协调暂停/恢复/取消，保证每个任务
//! 同一时刻至多一个执行器。单把互斥锁保护任务表、运行句柄表、错误
//! 重试表和脏标志；除刷写本身外，任何操作都不持锁做外部 I/O。

use crate::config::ArchiveConfig;
use crate::engine::signal::{signal_channel, SignalSender};
use crate::engine::worker::Stage;
use crate::errors::ArchiveError;
use crate::events::{ArchiveEvent, EventBus};
use crate::job::{ErrorState, JobDescriptor, JobPhase, JobState};
use crate::persistence::{HistoryStore, JobHistory};
use crate::source::{ConversationSource, MessageRenderer, SubtreeSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 应用前后台状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// 前台
    Foreground,
    /// 后台
    Background,
}

/// 外部内容源集合（由外层注入）
#[derive(Clone)]
pub struct ArchiveSources {
    /// 虚拟文件系统子树源
    pub subtree: Arc<dyn SubtreeSource>,
    /// 会话分页源
    pub conversations: Arc<dyn ConversationSource>,
    /// 消息渲染器
    pub renderer: Arc<dyn MessageRenderer>,
}

/// 运行中任务的取消句柄
///
/// 注册表对每个任务至多持有一个；认领成功时插入，阶段结束时移除。
pub(crate) struct RunningHandle {
    /// 认领序号，用于防止移除别人后插入的新句柄
    pub claim_id: u64,
    /// 任务级取消令牌（引擎关停令牌的子令牌）
    pub token: CancellationToken,
    /// 执行器退出时通知，暂停方借此阻塞到状态静止
    pub drained: Arc<Notify>,
}

/// 注册表内部状态（单锁保护）
pub(crate) struct RegistryInner {
    /// 是否已启动
    pub started: bool,
    /// 是否已从存储加载
    pub inited: bool,
    /// 是否有未刷写的变更
    pub dirty: bool,
    /// 任务历史
    pub history: JobHistory,
    /// 运行句柄表：jobID → 取消句柄
    pub running: HashMap<String, RunningHandle>,
    /// 错误重试表：jobID → 错误状态（仅 Error 阶段的任务有记录）
    pub errors: HashMap<String, ErrorState>,
}

/// 各阶段信号发送端
pub(crate) struct StageSignals {
    pub indexing: SignalSender,
    pub copying: SignalSender,
    pub packaging: SignalSender,
}

/// 引擎运行时（start 时创建，stop 时拆除）
struct EngineRuntime {
    signals: Option<StageSignals>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// 归档任务注册表
pub struct ArchiveManager {
    pub(crate) config: ArchiveConfig,
    pub(crate) sources: ArchiveSources,
    pub(crate) inner: Mutex<RegistryInner>,
    pub(crate) events: EventBus,
    store: Arc<dyn HistoryStore>,
    runtime: std::sync::Mutex<EngineRuntime>,
    app_state_tx: watch::Sender<AppState>,
    claim_counter: AtomicU64,
}

impl ArchiveManager {
    pub fn new(
        config: ArchiveConfig,
        store: Arc<dyn HistoryStore>,
        sources: ArchiveSources,
    ) -> Arc<Self> {
        let (app_state_tx, _) = watch::channel(AppState::Foreground);
        Arc::new(Self {
            config,
            sources,
            store,
            inner: Mutex::new(RegistryInner {
                started: false,
                inited: false,
                dirty: false,
                history: JobHistory::default(),
                running: HashMap::new(),
                errors: HashMap::new(),
            }),
            events: EventBus::default(),
            runtime: std::sync::Mutex::new(EngineRuntime {
                signals: None,
                shutdown: CancellationToken::new(),
                tasks: Vec::new(),
            }),
            app_state_tx,
            claim_counter: AtomicU64::new(1),
        })
    }

    // ========================================================================
    // 启动和关闭
    // ========================================================================

    /// 启动注册表（幂等）
    ///
    /// 首次调用时从存储加载历史，把崩溃时停在工作阶段的任务回退到
    /// 就绪阶段，然后拉起刷写循环、三个阶段工作协程、错误重试协程、
    /// 前后台监控和延迟恢复任务。
    pub async fn start(self: &Arc<Self>) -> Result<(), ArchiveError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.started {
                return Ok(());
            }
            self.init_locked(&mut inner)?;
            inner.started = true;
        }

        let (idx_tx, idx_rx) = signal_channel();
        let (cp_tx, cp_rx) = signal_channel();
        let (pk_tx, pk_rx) = signal_channel();
        let shutdown = CancellationToken::new();

        {
            let mut rt = self.runtime.lock().unwrap();
            rt.signals = Some(StageSignals {
                indexing: idx_tx,
                copying: cp_tx,
                packaging: pk_tx,
            });
            rt.shutdown = shutdown.clone();
            rt.tasks.clear();
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            self.clone().flush_loop(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(crate::engine::worker::stage_worker(
            self.clone(),
            Stage::Indexing,
            idx_rx,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(crate::engine::worker::stage_worker(
            self.clone(),
            Stage::Copying,
            cp_rx,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(crate::engine::worker::stage_worker(
            self.clone(),
            Stage::Packaging,
            pk_rx,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            self.clone().retry_worker(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(self.clone().app_state_monitor(
            shutdown.clone(),
            self.app_state_tx.subscribe(),
        )));
        // 启动后延迟恢复后台暂停的任务
        tasks.push(tokio::spawn(
            self.clone().resume_background_jobs_after_delay(shutdown),
        ));

        self.runtime.lock().unwrap().tasks = tasks;

        self.pulse_all();
        info!("归档引擎已启动");
        Ok(())
    }

    /// 停止注册表
    ///
    /// 所有运行中任务转为后台暂停并强制刷写，然后取消引擎令牌。
    /// 返回的句柄在全部工作协程退出后完成。
    pub async fn stop(&self) -> tokio::task::JoinHandle<()> {
        let drains;
        {
            let mut inner = self.inner.lock().await;
            if !inner.started {
                return tokio::spawn(async {});
            }
            inner.started = false;
            drains = self.bg_pause_all_locked(&mut inner);
            if let Err(e) = self.flush_locked(&mut inner) {
                warn!("停止时刷写状态失败: {}", e);
            }
        }

        let (shutdown, tasks) = {
            let mut rt = self.runtime.lock().unwrap();
            rt.signals = None;
            (rt.shutdown.clone(), std::mem::take(&mut rt.tasks))
        };
        shutdown.cancel();

        tokio::spawn(async move {
            for drained in drains {
                drained.notified().await;
            }
            for task in tasks {
                let _ = task.await;
            }
            debug!("归档引擎已完全停止");
        })
    }

    /// 存储重置钩子：标记为未加载，下次访问时重新读取
    pub async fn on_db_nuke(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return;
        }
        inner.inited = false;
        info!("存储已重置，任务历史将在下次访问时重新加载");
    }

    /// 上报应用前后台状态变化
    pub fn set_app_state(&self, state: AppState) {
        let _ = self.app_state_tx.send(state);
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // 公开任务操作
    // ========================================================================

    /// 创建新任务：插入 Queued 阶段并唤醒索引协程
    pub async fn start_job(&self, desc: JobDescriptor) -> Result<(), ArchiveError> {
        let mut inner = self.inner.lock().await;
        self.init_locked(&mut inner)?;

        let job_id = desc.job_id.clone();
        if inner.history.jobs.contains_key(&job_id) {
            return Err(ArchiveError::JobExists(job_id));
        }
        info!("创建归档任务 {}", job_id);
        inner.history.jobs.insert(job_id, JobState::new(desc));
        inner.dirty = true;
        if let Err(e) = self.flush_locked(&mut inner) {
            warn!("创建任务后刷写状态失败: {}", e);
        }
        drop(inner);

        self.pulse_stage(Stage::Indexing);
        Ok(())
    }

    /// 列出全部任务，按 (启动时间, 任务 ID) 升序
    pub async fn list(&self) -> Result<Vec<JobState>, ArchiveError> {
        let mut inner = self.inner.lock().await;
        self.init_locked(&mut inner)?;

        let mut jobs: Vec<JobState> = inner.history.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            (a.started_at, &a.desc.job_id).cmp(&(b.started_at, &b.desc.job_id))
        });
        Ok(jobs)
    }

    /// 查询单个任务
    pub async fn get(&self, job_id: &str) -> Result<JobState, ArchiveError> {
        let mut inner = self.inner.lock().await;
        self.init_locked(&mut inner)?;

        inner
            .history
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))
    }

    /// 删除任务
    ///
    /// 取消运行中的执行（忽略其中间状态），从历史中移除，总是清理
    /// 暂存工作区，按需移除输出目录。
    pub async fn delete(
        &self,
        job_id: &str,
        delete_output_path: bool,
    ) -> Result<(), ArchiveError> {
        let desc = {
            let mut inner = self.inner.lock().await;
            self.init_locked(&mut inner)?;

            if let Some(handle) = inner.running.remove(job_id) {
                // 删除时不关心任务的收尾状态，直接取消
                handle.token.cancel();
            }
            let job = inner
                .history
                .jobs
                .remove(job_id)
                .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))?;
            inner.errors.remove(job_id);
            inner.dirty = true;
            job.desc
        };

        info!("删除归档任务 {}", job_id);
        if let Err(e) = tokio::fs::remove_dir_all(desc.workspace_dir()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("清理暂存工作区 {:?} 失败: {}", desc.workspace_dir(), e);
            }
        }
        if delete_output_path {
            if let Err(e) = tokio::fs::remove_dir_all(&desc.output_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("清理输出目录 {:?} 失败: {}", desc.output_path, e);
                }
            }
        }
        Ok(())
    }

    /// 暂停运行中的任务
    ///
    /// 取消执行器并阻塞到其完全退出，之后记录 Paused 和恢复阶段。
    pub async fn pause(&self, job_id: &str) -> Result<(), ArchiveError> {
        let (token, drained, working_phase) = {
            let mut inner = self.inner.lock().await;
            self.init_locked(&mut inner)?;

            let job = inner
                .history
                .jobs
                .get(job_id)
                .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))?;
            let phase = job.phase;
            if !phase.is_working() {
                return Err(ArchiveError::NotRunning {
                    job_id: job_id.to_string(),
                    phase,
                });
            }
            let handle = inner
                .running
                .remove(job_id)
                .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))?;
            (handle.token, handle.drained, phase)
        };

        info!("暂停归档任务 {}", job_id);
        token.cancel();
        // 阻塞到执行器静止，保证返回时状态不再变化
        drained.notified().await;

        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            // 取消期间执行器可能刚好跑完了该阶段，此时不回写 Paused
            if job.phase == working_phase {
                job.resume_phase = Some(working_phase.eligible_phase());
                job.phase = JobPhase::Paused;
                inner.dirty = true;
                self.events.publish(ArchiveEvent::PhaseChanged {
                    job_id: job_id.to_string(),
                    old_phase: working_phase,
                    new_phase: JobPhase::Paused,
                });
            } else {
                debug!("任务 {} 已推进到 {:?}，暂停落空", job_id, job.phase);
            }
        }
        Ok(())
    }

    /// 恢复暂停 / 后台暂停 / 出错的任务
    ///
    /// Resume 对错误重试表有权威性：直接清除记录并立刻回到就绪阶段，
    /// 不等重试协程。对已完成的任务是无操作。
    pub async fn resume(&self, job_id: &str) -> Result<(), ArchiveError> {
        {
            let mut inner = self.inner.lock().await;
            self.init_locked(&mut inner)?;

            let phase = inner
                .history
                .jobs
                .get(job_id)
                .ok_or_else(|| ArchiveError::JobNotFound(job_id.to_string()))?
                .phase;
            match phase {
                JobPhase::Done => {
                    debug!("任务 {} 已完成，恢复为无操作", job_id);
                    return Ok(());
                }
                JobPhase::Paused | JobPhase::BackgroundPaused | JobPhase::Error => {}
                phase => {
                    return Err(ArchiveError::NotResumable {
                        job_id: job_id.to_string(),
                        phase,
                    });
                }
            }

            inner.errors.remove(job_id);
            let job = inner.history.jobs.get_mut(job_id).unwrap();
            let old = job.phase;
            let back = job.resume_phase.take().unwrap_or(JobPhase::Queued);
            job.phase = back;
            job.err_message = None;
            inner.dirty = true;
            info!("恢复归档任务 {}: {:?} -> {:?}", job_id, old, back);
            self.events.publish(ArchiveEvent::PhaseChanged {
                job_id: job_id.to_string(),
                old_phase: old,
                new_phase: back,
            });
        }

        self.pulse_all();
        Ok(())
    }

    // ========================================================================
    // 内部：加载与刷写
    // ========================================================================

    /// 首次访问时从存储加载历史（持锁调用）
    ///
    /// 加载失败视为致命错误直接上浮，不自动重试。
    pub(crate) fn init_locked(
        &self,
        inner: &mut RegistryInner,
    ) -> Result<(), ArchiveError> {
        if inner.inited {
            return Ok(());
        }
        match self.store.load() {
            Ok(Some(history)) => {
                inner.history = history;
                // 崩溃恢复：停在工作阶段的任务回退到各自的就绪阶段
                for (job_id, job) in inner.history.jobs.iter_mut() {
                    if job.phase.is_working() {
                        let back = job.phase.eligible_phase();
                        debug!("任务 {} 阶段回退: {:?} -> {:?}", job_id, job.phase, back);
                        job.phase = back;
                        job.resume_phase = None;
                        inner.dirty = true;
                    }
                }
                info!("任务历史已加载: {} 个任务", inner.history.jobs.len());
            }
            Ok(None) => {
                inner.history = JobHistory::default();
                // 尚未持久化过，标脏让刷写循环写出初始快照
                inner.dirty = true;
                debug!("存储中无任务历史，以空历史初始化");
            }
            Err(e) => return Err(ArchiveError::Store(e.to_string())),
        }
        inner.inited = true;
        Ok(())
    }

    /// 有脏标志时写出快照（持锁调用）
    pub(crate) fn flush_locked(&self, inner: &mut RegistryInner) -> anyhow::Result<()> {
        if !inner.dirty {
            return Ok(());
        }
        self.store.save(&inner.history)?;
        inner.dirty = false;
        Ok(())
    }

    /// 后台刷写循环
    async fn flush_loop(self: Arc<Self>, shutdown: CancellationToken) {
        debug!("刷写循环已启动，间隔 {:?}", self.config.flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("刷写循环退出");
                    return;
                }
                _ = tokio::time::sleep(self.config.flush_interval) => {}
            }
            let mut inner = self.inner.lock().await;
            if let Err(e) = self.flush_locked(&mut inner) {
                // 刷写失败不影响运行中的任务，下个周期重试
                warn!("定时刷写状态失败: {}", e);
            }
        }
    }

    // ========================================================================
    // 内部：前后台与延迟恢复
    // ========================================================================

    /// 前后台状态监控
    async fn app_state_monitor(
        self: Arc<Self>,
        shutdown: CancellationToken,
        mut rx: watch::Receiver<AppState>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let state = *rx.borrow();
            match state {
                AppState::Background => {
                    info!("应用进入后台，暂停所有运行中任务");
                    self.background_pause_all().await;
                }
                AppState::Foreground => {
                    info!("应用回到前台，延迟恢复后台暂停任务");
                    let mgr = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(mgr.resume_background_jobs_after_delay(shutdown));
                }
            }
        }
    }

    /// 把所有运行中任务转为后台暂停（持锁部分）
    ///
    /// 返回各执行器的静止通知，调用方在锁外等待
    fn bg_pause_all_locked(&self, inner: &mut RegistryInner) -> Vec<Arc<Notify>> {
        let mut drains = Vec::new();
        let handles: Vec<(String, RunningHandle)> = inner.running.drain().collect();
        for (job_id, handle) in handles {
            handle.token.cancel();
            drains.push(handle.drained);
            if let Some(job) = inner.history.jobs.get_mut(&job_id) {
                if job.phase.is_working() {
                    let old = job.phase;
                    job.resume_phase = Some(old.eligible_phase());
                    job.phase = JobPhase::BackgroundPaused;
                    self.events.publish(ArchiveEvent::PhaseChanged {
                        job_id: job_id.clone(),
                        old_phase: old,
                        new_phase: JobPhase::BackgroundPaused,
                    });
                }
            }
        }
        if !drains.is_empty() {
            inner.dirty = true;
        }
        drains
    }

    /// 后台暂停所有任务并强制刷写
    async fn background_pause_all(&self) {
        let drains = {
            let mut inner = self.inner.lock().await;
            let drains = self.bg_pause_all_locked(&mut inner);
            if let Err(e) = self.flush_locked(&mut inner) {
                warn!("后台暂停后刷写状态失败: {}", e);
            }
            drains
        };
        for drained in drains {
            drained.notified().await;
        }
    }

    /// 延迟后恢复所有后台暂停的任务
    async fn resume_background_jobs_after_delay(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.resume_jobs_delay) => {}
        }

        let mut resumed = 0;
        {
            let mut inner = self.inner.lock().await;
            if self.init_locked(&mut inner).is_err() {
                return;
            }
            for (job_id, job) in inner.history.jobs.iter_mut() {
                if job.phase == JobPhase::BackgroundPaused {
                    let back = job.resume_phase.take().unwrap_or(JobPhase::Queued);
                    debug!("自动恢复任务 {}: BackgroundPaused -> {:?}", job_id, back);
                    job.phase = back;
                    resumed += 1;
                    self.events.publish(ArchiveEvent::PhaseChanged {
                        job_id: job_id.clone(),
                        old_phase: JobPhase::BackgroundPaused,
                        new_phase: back,
                    });
                }
            }
            if resumed > 0 {
                inner.dirty = true;
            }
        }
        if resumed > 0 {
            info!("已自动恢复 {} 个后台暂停任务", resumed);
            self.pulse_all();
        }
    }

    // ========================================================================
    // 内部：工作协程支撑
    // ========================================================================

    /// 分配一个任务级取消令牌（引擎关停令牌的子令牌）
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.runtime.lock().unwrap().shutdown.child_token()
    }

    /// 下一个认领序号
    pub(crate) fn next_claim_id(&self) -> u64 {
        self.claim_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// 唤醒指定阶段的工作协程
    pub(crate) fn pulse_stage(&self, stage: Stage) {
        let rt = self.runtime.lock().unwrap();
        if let Some(signals) = &rt.signals {
            match stage {
                Stage::Indexing => signals.indexing.pulse(),
                Stage::Copying => signals.copying.pulse(),
                Stage::Packaging => signals.packaging.pulse(),
            }
        }
    }

    /// 唤醒所有阶段的工作协程
    pub(crate) fn pulse_all(&self) {
        let rt = self.runtime.lock().unwrap();
        if let Some(signals) = &rt.signals {
            signals.indexing.pulse();
            signals.copying.pulse();
            signals.packaging.pulse();
        }
    }

    /// 累加已复制字节数（允许负增量用于完整性回退），并发进度事件
    pub(crate) async fn add_bytes_copied(&self, job_id: &str, delta: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            if delta >= 0 {
                job.bytes_done = job.bytes_done.saturating_add(delta as u64);
            } else {
                job.bytes_done = job.bytes_done.saturating_sub(delta.unsigned_abs());
            }
            let (done, total) = job.progress_pair();
            inner.dirty = true;
            self.events.publish(ArchiveEvent::Progress {
                job_id: job_id.to_string(),
                done,
                total,
            });
        }
    }

    /// 累加已归档消息数（会话任务）；总量按估计值封顶，不超报
    pub(crate) async fn add_items_done(&self, job_id: &str, delta: u64, last_page: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            job.items_done += delta;
            if job.items_done > job.items_total || last_page {
                job.items_done = job.items_done.min(job.items_total);
            }
            let (done, total) = job.progress_pair();
            inner.dirty = true;
            self.events.publish(ArchiveEvent::Progress {
                job_id: job_id.to_string(),
                done,
                total,
            });
        }
    }

    /// 更新清单条目（标脏，由刷写循环和阶段边界持久化）
    pub(crate) async fn update_manifest_entry<F>(&self, job_id: &str, path: &str, f: F)
    where
        F: FnOnce(&mut crate::job::EntryCheckpoint),
    {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            if let Some(entry) = job.manifest.get_mut(path) {
                f(entry);
                inner.dirty = true;
            }
        }
    }

    /// 保存会话检查点
    pub(crate) async fn checkpoint_conv(
        &self,
        job_id: &str,
        conv_id: &str,
        cp: crate::job::ConvCheckpoint,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.history.jobs.get_mut(job_id) {
            job.checkpoints.insert(conv_id.to_string(), cp);
            inner.dirty = true;
        }
    }
}
