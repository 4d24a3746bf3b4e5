//! 执行器（Executor）与固定大小的工作池
//!
//! 执行器是流水线中唯一的背压点：内部缓冲容量等于池大小，
//! 缓冲满时 `execute` 挂起，调度循环随之停止出队（发布不受影响）。
//!
use crate::error::{BusError, BusResult as Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 默认池大小
pub const DEFAULT_POOL_SIZE: usize = 5;

/// 提交给执行器的任务；参数为执行器关闭时触发的取消令牌
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// 将异步闭包包装为 `Job`
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// 提交任务；缓冲已满时等待
    async fn execute(&self, job: Job) -> Result<()>;

    /// 停止接收任务并等待所有工作者退出，返回被放弃的未开始任务数
    async fn shutdown(&self) -> usize;
}

/// 固定数量工作者共享一个有界通道
pub struct PooledExecutor {
    size: usize,
    tx: mpsc::Sender<Job>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PooledExecutor {
    /// 创建并立即启动工作者，需在 tokio 运行时内调用
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel(size);
        let rx = Arc::new(AsyncMutex::new(rx));
        let token = CancellationToken::new();

        let workers = (0..size)
            .map(|worker| tokio::spawn(Self::worker_loop(worker, rx.clone(), token.clone())))
            .collect();

        Self {
            size,
            tx,
            rx,
            token,
            workers: Mutex::new(workers),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    async fn worker_loop(
        worker: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
        token: CancellationToken,
    ) {
        loop {
            let next = {
                let mut rx = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    guard = rx.lock() => guard,
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    job = rx.recv() => job,
                }
            };

            let Some(job) = next else { break };
            if AssertUnwindSafe(job(token.clone()))
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!(worker, "job panicked");
            }
        }
        tracing::trace!(worker, "worker stopped");
    }
}

impl Default for PooledExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    async fn execute(&self, job: Job) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(BusError::executor("executor is shut down")),
            sent = self.tx.send(job) => {
                sent.map_err(|_| BusError::executor("executor is shut down"))
            }
        }
    }

    async fn shutdown(&self) -> usize {
        self.token.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for w in workers {
            let _ = w.await;
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut abandoned = 0;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        abandoned
    }
}

impl Drop for PooledExecutor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, oneshot};

    #[tokio::test(flavor = "multi_thread")]
    async fn executes_submitted_job() {
        let pool = PooledExecutor::new(1);
        let (tx, rx) = oneshot::channel();
        pool.execute(job(move |_| async move {
            let _ = tx.send("hello");
        }))
        .await
        .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "hello");
        assert_eq!(pool.shutdown().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_blocks_when_buffer_is_full() {
        let pool = PooledExecutor::new(1);
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        // 占住唯一的工作者
        {
            let release = release.clone();
            let started = started.clone();
            pool.execute(job(move |_| async move {
                started.notify_one();
                release.notified().await;
            }))
            .await
            .unwrap();
        }
        started.notified().await;

        // 填满容量为 1 的缓冲
        pool.execute(job(|_| async {})).await.unwrap();

        let third = tokio::time::timeout(
            Duration::from_millis(50),
            pool.execute(job(|_| async {})),
        )
        .await;
        assert!(third.is_err(), "third submission should wait for capacity");

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), pool.execute(job(|_| async {})))
            .await
            .expect("capacity should free up")
            .unwrap();
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_waits_for_in_flight_and_reports_unstarted() {
        let pool = PooledExecutor::new(1);
        let finished = Arc::new(AtomicBool::new(false));
        let started = Arc::new(Notify::new());

        {
            let finished = finished.clone();
            let started = started.clone();
            pool.execute(job(move |token| async move {
                started.notify_one();
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.store(true, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }
        started.notified().await;
        pool.execute(job(|_| async {})).await.unwrap();

        let abandoned = pool.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(abandoned, 1);

        assert!(pool.execute(job(|_| async {})).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_job_does_not_shrink_pool() {
        let pool = PooledExecutor::new(1);
        pool.execute(job(|_| async { panic!("boom") })).await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            pool.execute(job(move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while ran.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn zero_size_is_clamped() {
        let pool = PooledExecutor::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.shutdown().await, 0);
    }
}
