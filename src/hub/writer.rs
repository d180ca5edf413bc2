//! 后台写库
//!
//! 单一写线程按提交顺序执行写库任务，队列有界，满时丢弃并告警。

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use crate::storage::Storage;

/// 写库队列容量
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce(&dyn Storage) -> crate::Result<()> + Send>;

enum Task {
    Write { op: &'static str, job: Job },
    Flush(oneshot::Sender<()>),
}

/// 写库任务提交端，全部 drop 后写线程退出
pub struct StorageWriter {
    tx: mpsc::Sender<Task>,
}

impl StorageWriter {
    /// 启动写线程
    pub fn spawn(storage: Arc<dyn Storage>, capacity: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Task>(capacity);
        std::thread::Builder::new()
            .name("snitch-hub-writer".to_string())
            .spawn(move || {
                while let Some(task) = rx.blocking_recv() {
                    match task {
                        Task::Write { op, job } => {
                            if let Err(e) = job(storage.as_ref()) {
                                tracing::error!("💾 持久化失败: op={}, {}", op, e);
                            }
                        }
                        Task::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                tracing::debug!("💾 写库线程退出");
            })?;
        Ok(Self { tx })
    }

    /// 提交写库任务，不等待结果
    pub fn submit<F>(&self, op: &'static str, job: F)
    where
        F: FnOnce(&dyn Storage) -> crate::Result<()> + Send + 'static,
    {
        let task = Task::Write {
            op,
            job: Box::new(job),
        };
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("💾 写库队列已满，丢弃: op={}", op);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!("💾 写库线程已退出，丢弃: op={}", op);
            }
        }
    }

    /// 等待此前提交的任务全部执行完
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Task::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}
