//! 总线统一错误定义
//!
//! 仅覆盖发布者可感知的失败（暂存、序列化、关闭）以及各可插拔组件
//! 需要上报的最小错误集合。处理器自身的错误使用 `anyhow::Error`，
//! 由总线内部转换为重试，不会暴露给发布者。
//!
use crate::event::EventId;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 发布 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("bus is shut down")]
    ShutDown,

    // --- 可插拔组件 ---
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("executor error: {reason}")]
    Executor { reason: String },
    #[error("scheduler closed: event_id={event_id}")]
    SchedulerClosed { event_id: EventId },
    #[error("dead letter error: event_id={event_id}, reason={reason}")]
    DeadLetter { event_id: EventId, reason: String },
}

impl BusError {
    pub fn storage(reason: impl Into<String>) -> Self {
        BusError::Storage {
            reason: reason.into(),
        }
    }

    pub fn executor(reason: impl Into<String>) -> Self {
        BusError::Executor {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;
