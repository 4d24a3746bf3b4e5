//! 暂存存储（Storage）
//!
//! 事件在交给处理器之前先暂存，确认阶段成功后删除；
//! 存储中是否还有某事件，即是该事件是否"尚未处理完成"的判据。
//!
//! 该模块只定义协议与一个内存实现，持久化后端由上层注入。
//!
mod memory;

pub use memory::InMemoryStorage;

use crate::error::BusResult as Result;
use crate::event::{Event, EventId};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Storage: Send + Sync {
    /// 分配新 ID 并记录事件，需支持并发调用
    async fn sink(&self, topic: &str, event: &Event) -> Result<EventId>;

    /// 列出当前暂存的全部事件（启动恢复用）
    async fn fetch(&self) -> Result<Vec<Event>>;

    /// 删除记录；ID 不存在视为成功
    async fn delete(&self, id: EventId) -> Result<()>;
}

#[async_trait]
impl<T> Storage for Arc<T>
where
    T: Storage + ?Sized,
{
    async fn sink(&self, topic: &str, event: &Event) -> Result<EventId> {
        (**self).sink(topic, event).await
    }

    async fn fetch(&self) -> Result<Vec<Event>> {
        (**self).fetch().await
    }

    async fn delete(&self, id: EventId) -> Result<()> {
        (**self).delete(id).await
    }
}
