//! 调度器（Scheduler）
//!
//! 将工作单元缓冲在 FIFO 队列中，由长驻的调度任务逐个取出并交给分发函数
//! （通常是提交到执行器）。分发函数被同步等待，执行器饱和时调度任务随之阻塞。
//!
use crate::error::{BusError, BusResult as Result};
use crate::event::UnitOfWork;
use crate::queue::{FifoQueue, TaskQueue};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// 分发函数：调度循环对每个出队单元调用一次
pub type Dispatch = Arc<dyn Fn(UnitOfWork) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// 非阻塞地追加工作单元；关闭后返回 `SchedulerClosed`
    fn add_event_task(&self, unit: UnitOfWork) -> Result<()>;

    /// 运行调度循环，直到 `close` 被调用
    async fn schedule(&self, dispatch: Dispatch);

    /// 停止调度循环，返回被放弃（尚未出队）的工作单元
    fn close(&self) -> Vec<UnitOfWork>;

    /// 队列中等待分发的单元数
    fn pending(&self) -> usize;
}

/// 基于 `TaskQueue` 的调度器，队列实现通过类型参数注入
pub struct QueueScheduler<Q = FifoQueue<UnitOfWork>> {
    queue: Q,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::with_queue(FifoQueue::new())
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q> QueueScheduler<Q>
where
    Q: TaskQueue<UnitOfWork>,
{
    pub fn with_queue(queue: Q) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<Q> Scheduler for QueueScheduler<Q>
where
    Q: TaskQueue<UnitOfWork>,
{
    fn add_event_task(&self, unit: UnitOfWork) -> Result<()> {
        self.queue.push(unit).map_err(|unit| BusError::SchedulerClosed {
            event_id: unit.event().id(),
        })
    }

    async fn schedule(&self, dispatch: Dispatch) {
        tracing::debug!("dispatch loop started");
        self.queue.drain(|unit| dispatch(unit)).await;
        tracing::debug!("dispatch loop stopped");
    }

    fn close(&self) -> Vec<UnitOfWork> {
        self.queue.close()
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Phase};
    use futures_util::FutureExt;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording_dispatch(seen: Arc<Mutex<Vec<(u64, Phase)>>>) -> Dispatch {
        Arc::new(move |unit: UnitOfWork| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .unwrap()
                    .push((unit.event().id(), unit.phase()));
            }
            .boxed()
        })
    }

    fn unit(id: u64) -> UnitOfWork {
        UnitOfWork::deliver(Event::new("t", Value::Null).with_id(id))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn units_added_before_schedule_are_dispatched_in_order() {
        let s = Arc::new(QueueScheduler::new());
        s.add_event_task(unit(1)).unwrap();
        s.add_event_task(UnitOfWork::acknowledge(
            Event::new("t", Value::Null).with_id(2),
        ))
        .unwrap();
        assert_eq!(s.pending(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let s = s.clone();
            let dispatch = recording_dispatch(seen.clone());
            tokio::spawn(async move { s.schedule(dispatch).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(s.close().is_empty());
        task.await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Phase::Deliver), (2, Phase::Acknowledge)]
        );
    }

    #[test]
    fn add_after_close_reports_event_id() {
        let s = QueueScheduler::new();
        s.add_event_task(unit(1)).unwrap();
        let abandoned = s.close();
        assert_eq!(abandoned.len(), 1);

        match s.add_event_task(unit(9)) {
            Err(BusError::SchedulerClosed { event_id }) => assert_eq!(event_id, 9),
            other => panic!("unexpected {other:?}"),
        }
    }
}
