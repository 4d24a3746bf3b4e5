//! 事件处理器（Handler）与订阅表
//!
//! 每个主题至多注册一个处理器，后注册的覆盖先注册的；
//! 未订阅的主题在投递时解析为 `NoopHandler`，事件被视为已投递。
//!
use crate::event::{Event, EventId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// 单次投递尝试的上下文
#[derive(Clone, Debug)]
pub struct HandlerContext {
    event_id: EventId,
    topic: String,
    err_count: u64,
    cancellation: CancellationToken,
}

impl HandlerContext {
    pub(crate) fn new(event: &Event, cancellation: CancellationToken) -> Self {
        Self {
            event_id: event.id(),
            topic: event.topic().to_string(),
            err_count: event.err_count(),
            cancellation,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 本次尝试之前连续失败的次数
    pub fn err_count(&self) -> u64 {
        self.err_count
    }

    /// 总线关闭时触发
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// 事件处理器：返回错误即触发重试
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, payload: &Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, payload: &Value) -> anyhow::Result<()> {
        (self)(ctx.clone(), payload.clone()).await
    }
}

/// 总是成功的处理器
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn handle(&self, _ctx: &HandlerContext, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 主题 → 处理器 映射；写操作独占，投递解析共享读
#[derive(Default)]
pub(crate) struct Subscriptions {
    by_topic: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Subscriptions {
    pub(crate) fn insert(&self, topic: String, handler: Arc<dyn Handler>) -> bool {
        let mut guard = self.by_topic.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(topic, handler).is_some()
    }

    pub(crate) fn remove(&self, topic: &str) -> bool {
        let mut guard = self.by_topic.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(topic).is_some()
    }

    pub(crate) fn resolve(&self, topic: &str) -> Arc<dyn Handler> {
        let guard = self.by_topic.read().unwrap_or_else(PoisonError::into_inner);
        match guard.get(topic) {
            Some(h) => h.clone(),
            None => Arc::new(NoopHandler),
        }
    }
}
