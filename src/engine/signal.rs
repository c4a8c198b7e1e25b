//! 阶段唤醒信号
//!
//! 容量为 1 的合并信号通道。`pulse` 非阻塞：通道已满时直接丢弃，
//! 因为工作协程下一轮迭代本来就会重新检查。

use tokio::sync::mpsc;

/// 信号发送端
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<()>,
}

impl SignalSender {
    /// 发出一次唤醒（通道里已有信号时丢弃本次）
    pub fn pulse(&self) {
        let _ = self.tx.try_send(());
    }
}

/// 信号接收端（每个阶段唯一的工作协程持有）
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<()>,
}

impl SignalReceiver {
    /// 等待下一次唤醒；发送端全部关闭时返回 false
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// 创建一对信号端点
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (SignalSender { tx }, SignalReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pulse_wakes_receiver() {
        let (tx, mut rx) = signal_channel();
        tx.pulse();
        assert!(rx.wait().await);
    }

    #[tokio::test]
    async fn test_pulses_coalesce() {
        let (tx, mut rx) = signal_channel();
        // 连续多次 pulse 只留下一个信号
        tx.pulse();
        tx.pulse();
        tx.pulse();
        assert!(rx.wait().await);

        // 通道应当已空
        let timeout =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.wait()).await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_false_when_closed() {
        let (tx, mut rx) = signal_channel();
        drop(tx);
        assert!(!rx.wait().await);
    }
}
