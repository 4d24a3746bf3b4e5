//! 事件与工作单元
//!
//! - `Event`：暂存于存储中的事件，ID 由存储分配；
//! - `UnitOfWork`：某个事件某一阶段（投递 / 确认）的一次尝试。
//!
//! 工作单元按值持有事件，单元在 队列 → 执行器 → 工作者 之间移动，
//! 因此同一事件在任意时刻至多只有一个正在执行的尝试。
//!
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件 ID，由存储实例单调分配，从 1 开始
pub type EventId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 存储分配的唯一 ID（暂存前为 0）
    id: EventId,
    /// 主题
    topic: String,
    /// 事件负载
    data: Value,
    /// 当前阶段连续失败次数
    err_count: u64,
    /// 创建时间
    staged_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: 0,
            topic: topic.into(),
            data,
            err_count: 0,
            staged_at: Utc::now(),
        }
    }

    /// 返回绑定了存储 ID 的事件
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn err_count(&self) -> u64 {
        self.err_count
    }

    pub fn staged_at(&self) -> DateTime<Utc> {
        self.staged_at
    }

    pub(crate) fn record_failure(&mut self) {
        self.err_count = self.err_count.saturating_add(1);
    }

    pub(crate) fn reset_err_count(&mut self) {
        self.err_count = 0;
    }
}

/// 工作单元所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 调用处理器
    Deliver,
    /// 从存储中删除（确认）
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    event: Event,
    phase: Phase,
}

impl UnitOfWork {
    pub fn deliver(event: Event) -> Self {
        Self {
            event,
            phase: Phase::Deliver,
        }
    }

    pub fn acknowledge(event: Event) -> Self {
        Self {
            event,
            phase: Phase::Acknowledge,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}
