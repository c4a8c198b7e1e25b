// 归档引擎模块
//
// - `manager.rs`: 任务注册表（启动/停止、增删查、暂停/恢复、刷写循环）
// - `worker.rs`: 阶段工作协程（认领 → 执行 → 推进/出错）
// - `signal.rs`: 容量为 1 的合并唤醒信号
// - `indexer.rs`: 索引阶段
// - `copier.rs`: 复制阶段（字节级可续传）
// - `conversations.rs`: 会话分页归档变体
// - `packager.rs`: 打包阶段（tar.gz / zip）
// - `retry.rs`: 错误重试工作协程

pub mod signal;

mod conversations;
mod copier;
mod indexer;
mod manager;
mod packager;
mod retry;
mod worker;

pub use manager::{AppState, ArchiveManager, ArchiveSources};
