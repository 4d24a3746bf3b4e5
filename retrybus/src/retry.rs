//! 重试策略与死信
//!
//! 默认策略与最初的行为一致：无限重试、无退避。需要限制时显式配置
//! `max_retries`，超过上限的事件交给 `DeadLetterSink` 并从暂存存储中确认删除。
//! 退避同时作用于投递与确认两个阶段，上限只作用于投递阶段。
//!
use crate::error::{BusError, BusResult as Result};
use crate::event::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// 两次尝试之间的等待
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// 立即重新入队
    #[default]
    None,
    /// 固定间隔
    Fixed { delay: Duration },
    /// 按失败次数指数增长，封顶 `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// 第 `err_count` 次失败后的等待时长；`None` 表示立即重试
    pub fn delay(&self, err_count: u64) -> Option<Duration> {
        let d = match *self {
            Backoff::None => return None,
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => {
                let shift = err_count.saturating_sub(1).min(31) as u32;
                initial.saturating_mul(1u32 << shift).min(max)
            }
        };
        (!d.is_zero()).then_some(d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 首次失败之后允许的重试次数；`None` 为不限
    pub max_retries: Option<u64>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limited(max_retries: u64) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// 连续失败 `err_count` 次后是否应放弃投递
    pub fn exhausted(&self, err_count: u64) -> bool {
        self.max_retries.is_some_and(|max| err_count > max)
    }
}

/// 死信接收端：接收超过重试上限的事件
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, event: &Event, reason: &str) -> Result<()>;
}

/// 仅记录日志
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetter;

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn dead_letter(&self, event: &Event, reason: &str) -> Result<()> {
        tracing::error!(
            event_id = event.id(),
            topic = event.topic(),
            err_count = event.err_count(),
            reason,
            "event dead-lettered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event: Event,
    pub reason: String,
}

/// 内存死信队列，可选容量上限
///
/// 已满时拒绝新的死信，总线随之继续重试该事件的投递。
#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
    capacity: Option<usize>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            letters: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn dead_letter(&self, event: &Event, reason: &str) -> Result<()> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        if self.capacity.is_some_and(|cap| letters.len() >= cap) {
            return Err(BusError::DeadLetter {
                event_id: event.id(),
                reason: "dead letter queue full".to_string(),
            });
        }
        letters.push(DeadLetter {
            event: event.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
