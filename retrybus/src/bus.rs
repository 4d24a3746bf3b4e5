//! 事件总线（EventBus）
//!
//! 将暂存存储、调度器与执行器串成"直到成功为止"的投递循环：
//! - `publish`：暂存事件后入队一个投递单元，暂存失败同步返回给发布者；
//! - 投递成功 → 入队确认单元（从存储删除）；失败 → 计数加一并重新入队投递；
//! - 确认失败同样计数并重新入队确认；
//! - 处理器在每次投递尝试执行时重新解析，发布后才订阅也能在下一次尝试生效。
//!
//! 任何组件调用期间都不持有订阅表的锁。
//! 总线记录在途事件的 ID，同一事件任何时刻至多存在一个工作单元。
//!
use crate::error::{BusError, BusResult as Result};
use crate::event::{Event, EventId, Phase, UnitOfWork};
use crate::executor::{Executor, Job, PooledExecutor};
use crate::handler::{Handler, HandlerContext, Subscriptions};
use crate::retry::{DeadLetterSink, LogDeadLetter, RetryPolicy};
use crate::scheduler::{Dispatch, QueueScheduler, Scheduler};
use crate::storage::{InMemoryStorage, Storage};
use bon::bon;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 总线配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 默认执行器的工作者数量（同时也是其缓冲容量）
    pub pool_size: usize,
    /// 重试策略
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pool_size: crate::executor::DEFAULT_POOL_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// 关闭时放弃的工作单元统计
///
/// 被放弃单元对应的事件仍留在暂存存储中，可通过 `EventBus::recover` 重新投递。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// 关闭时仍在调度队列中的单元
    pub queued: usize,
    /// 已交给执行器但尚未开始的单元
    pub unstarted: usize,
    /// 关闭期间无法再入队的后续单元（重试、确认、延迟重试）
    pub dropped: usize,
}

impl ShutdownReport {
    pub fn abandoned(&self) -> usize {
        self.queued + self.unstarted + self.dropped
    }
}

struct BusInner {
    subscriptions: Subscriptions,
    storage: Arc<dyn Storage>,
    scheduler: Arc<dyn Scheduler>,
    executor: Arc<dyn Executor>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    // 延迟重试的计时任务
    timers: TaskTracker,
    closing: CancellationToken,
    dropped: AtomicUsize,
    // 已入队且尚未确认的事件
    in_flight: Mutex<HashSet<EventId>>,
}

pub struct EventBus {
    inner: Arc<BusInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[bon]
impl EventBus {
    /// 构建总线并启动调度任务，需在 tokio 运行时内调用。
    ///
    /// 未提供的组件使用默认实现：`PooledExecutor`、`InMemoryStorage`、
    /// `QueueScheduler`（FIFO）与 `LogDeadLetter`。
    #[builder]
    pub fn new(
        executor: Option<Arc<dyn Executor>>,
        storage: Option<Arc<dyn Storage>>,
        scheduler: Option<Arc<dyn Scheduler>>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        #[builder(default)] config: BusConfig,
    ) -> Self {
        let executor =
            executor.unwrap_or_else(|| Arc::new(PooledExecutor::new(config.pool_size)));
        let storage = storage.unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let scheduler = scheduler.unwrap_or_else(|| Arc::new(QueueScheduler::new()));
        let dead_letter = dead_letter.unwrap_or_else(|| Arc::new(LogDeadLetter));

        let inner = Arc::new(BusInner {
            subscriptions: Subscriptions::default(),
            storage,
            scheduler,
            executor,
            dead_letter,
            retry: config.retry,
            timers: TaskTracker::new(),
            closing: CancellationToken::new(),
            dropped: AtomicUsize::new(0),
            in_flight: Mutex::new(HashSet::new()),
        });

        let dispatcher = tokio::spawn(BusInner::schedule(inner.clone()));

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

impl EventBus {
    /// 发布不带负载的事件
    pub async fn publish(&self, topic: impl Into<String>) -> Result<EventId> {
        self.publish_with_data(topic, ()).await
    }

    /// 发布事件；暂存失败或无法入队时返回错误。
    ///
    /// 入队失败（调度器已关闭）时事件仍留在存储中，可由 `recover` 重新投递。
    pub async fn publish_with_data<T>(&self, topic: impl Into<String>, data: T) -> Result<EventId>
    where
        T: Serialize,
    {
        if self.inner.closing.is_cancelled() {
            return Err(BusError::ShutDown);
        }

        let topic = topic.into();
        let event = Event::new(topic.clone(), serde_json::to_value(data)?);
        let id = self.inner.storage.sink(&topic, &event).await?;
        tracing::debug!(event_id = id, topic = %topic, "event staged");

        self.inner.track(id);
        if let Err(err) = self
            .inner
            .scheduler
            .add_event_task(UnitOfWork::deliver(event.with_id(id)))
        {
            self.inner.untrack(id);
            tracing::warn!(event_id = id, error = %err, "event staged but not queued");
            return Err(err);
        }
        Ok(id)
    }

    /// 注册处理器，覆盖该主题已有的处理器
    pub fn subscribe<H>(&self, topic: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        let topic = topic.into();
        if self.inner.subscriptions.insert(topic.clone(), Arc::new(handler)) {
            tracing::debug!(topic = %topic, "handler replaced");
        }
    }

    /// 移除处理器；之后的投递尝试视为无人订阅
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner.subscriptions.remove(topic)
    }

    /// 将存储中暂存的事件重新入队投递，返回入队数量。
    ///
    /// 用于使用持久化存储时的启动恢复；已在途的事件会被跳过。
    pub async fn recover(&self) -> Result<usize> {
        if self.inner.closing.is_cancelled() {
            return Err(BusError::ShutDown);
        }

        let events = self.inner.storage.fetch().await?;
        let mut n = 0;
        for event in events {
            if !self.inner.track(event.id()) {
                continue;
            }
            self.inner.enqueue(UnitOfWork::deliver(event));
            n += 1;
        }
        tracing::info!(recovered = n, "staged events re-enqueued");
        Ok(n)
    }

    /// 调度队列中等待分发的单元数
    pub fn pending(&self) -> usize {
        self.inner.scheduler.pending()
    }

    /// 关闭总线：停止接收发布、关闭调度器、关闭执行器并等待在途任务结束。
    ///
    /// 返回时不再有工作者在执行处理器。重复调用是安全的。
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        inner.closing.cancel();

        let queued = inner.scheduler.close().len();
        let unstarted = inner.executor.shutdown().await;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        inner.timers.close();
        inner.timers.wait().await;

        let report = ShutdownReport {
            queued,
            unstarted,
            dropped: inner.dropped.swap(0, Ordering::SeqCst),
        };
        tracing::info!(
            queued = report.queued,
            unstarted = report.unstarted,
            dropped = report.dropped,
            "event bus shut down"
        );
        report
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.inner.closing.is_cancelled() {
            return;
        }
        self.inner.closing.cancel();
        self.inner.scheduler.close();

        // 未调用 shutdown 时在后台关闭执行器，释放缓冲中的任务
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let executor = self.inner.executor.clone();
            rt.spawn(async move {
                executor.shutdown().await;
            });
        }
    }
}

impl BusInner {
    async fn schedule(self: Arc<Self>) {
        let dispatch: Dispatch = {
            let inner = self.clone();
            Arc::new(move |unit: UnitOfWork| inner.clone().dispatch(unit).boxed())
        };
        self.scheduler.schedule(dispatch).await;
    }

    /// 将出队的单元交给执行器；执行器饱和时在此等待
    async fn dispatch(self: Arc<Self>, unit: UnitOfWork) {
        let event_id = unit.event().id();
        let job: Job = {
            let inner = self.clone();
            Box::new(move |token: CancellationToken| inner.run(unit, token).boxed())
        };

        if let Err(err) = self.executor.execute(job).await {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(event_id, error = %err, "unit of work dropped");
        }
    }

    async fn run(self: Arc<Self>, unit: UnitOfWork, token: CancellationToken) {
        match unit.phase() {
            Phase::Deliver => self.deliver(unit.into_event(), token).await,
            Phase::Acknowledge => self.acknowledge(unit.into_event()).await,
        }
    }

    async fn deliver(self: Arc<Self>, mut event: Event, token: CancellationToken) {
        let handler = self.subscriptions.resolve(event.topic());
        let ctx = HandlerContext::new(&event, token);

        let outcome = AssertUnwindSafe(handler.handle(&ctx, event.data()))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => {
                tracing::trace!(event_id = event.id(), "event delivered");
                event.reset_err_count();
                self.enqueue(UnitOfWork::acknowledge(event));
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => "handler panicked".to_string(),
        };

        event.record_failure();
        tracing::warn!(
            event_id = event.id(),
            topic = event.topic(),
            err_count = event.err_count(),
            reason = %reason,
            "delivery failed"
        );

        if !self.retry.exhausted(event.err_count()) {
            self.requeue(UnitOfWork::deliver(event));
            return;
        }

        match self.dead_letter.dead_letter(&event, &reason).await {
            Ok(()) => {
                event.reset_err_count();
                self.enqueue(UnitOfWork::acknowledge(event));
            }
            Err(err) => {
                tracing::error!(event_id = event.id(), error = %err, "dead letter failed");
                self.requeue(UnitOfWork::deliver(event));
            }
        }
    }

    async fn acknowledge(self: Arc<Self>, mut event: Event) {
        match self.storage.delete(event.id()).await {
            Ok(()) => {
                self.untrack(event.id());
                tracing::trace!(event_id = event.id(), "event acknowledged");
            }
            Err(err) => {
                event.record_failure();
                tracing::warn!(
                    event_id = event.id(),
                    err_count = event.err_count(),
                    error = %err,
                    "acknowledge failed"
                );
                self.requeue(UnitOfWork::acknowledge(event));
            }
        }
    }

    /// 标记事件在途；已在途时返回 false
    fn track(&self, id: EventId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    fn untrack(&self, id: EventId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn enqueue(&self, unit: UnitOfWork) {
        if let Err(err) = self.scheduler.add_event_task(unit) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(error = %err, "unit of work dropped");
        }
    }

    /// 按退避策略重新入队失败的单元
    fn requeue(self: &Arc<Self>, unit: UnitOfWork) {
        let Some(delay) = self.retry.backoff.delay(unit.event().err_count()) else {
            self.enqueue(unit);
            return;
        };

        let inner = self.clone();
        self.timers.spawn(async move {
            tokio::select! {
                _ = inner.closing.cancelled() => {
                    inner.dropped.fetch_add(1, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(delay) => inner.enqueue(unit),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::time::Duration;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let c: BusConfig = serde_json::from_value(serde_json::json!({ "pool_size": 2 })).unwrap();
        assert_eq!(c.pool_size, 2);
        assert_eq!(c.retry, RetryPolicy::unlimited());

        let c: BusConfig = serde_json::from_value(serde_json::json!({
            "retry": { "max_retries": 1, "backoff": { "kind": "none" } }
        }))
        .unwrap();
        assert_eq!(c.pool_size, crate::executor::DEFAULT_POOL_SIZE);
        assert_eq!(c.retry.max_retries, Some(1));
        assert_eq!(c.retry.backoff, Backoff::None);
    }

    #[test]
    fn report_sums_abandoned_units() {
        let r = ShutdownReport {
            queued: 2,
            unstarted: 1,
            dropped: 3,
        };
        assert_eq!(r.abandoned(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn units_queued_at_shutdown_are_reported() {
        // 执行器先关闭，投递单元全部无法提交
        let executor = Arc::new(PooledExecutor::new(1));
        executor.shutdown().await;

        let storage = Arc::new(InMemoryStorage::new());
        let bus = EventBus::builder()
            .executor(executor)
            .storage(storage.clone())
            .build();

        for _ in 0..3 {
            bus.publish("t").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = bus.shutdown().await;
        assert_eq!(report.abandoned(), 3);
        assert_eq!(storage.len(), 3);
    }
}
