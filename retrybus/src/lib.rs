//! 进程内异步事件投递引擎（retrybus）
//!
//! 发布者按主题发布事件，每个主题至多一个处理器消费，处理失败时无限重试
//! （或按配置的 `RetryPolicy` 重试并转入死信），直至成功。
//!
//! 组成部分：
//! - 暂存存储（`storage`）：记录事件，确认成功后删除；
//! - 调度器（`scheduler`）与其依赖的 FIFO 队列（`queue`）；
//! - 执行器（`executor`）：固定大小工作池，也是唯一的背压点；
//! - 总线（`bus`）：订阅表与投递/确认状态机，将以上组件串联。
//!
//! 典型用法：
//! ```no_run
//! use retrybus::{EventBus, HandlerContext};
//! use serde_json::Value;
//!
//! # async fn run() -> retrybus::error::BusResult<()> {
//! let bus = EventBus::builder().build();
//! bus.subscribe("hello", |_ctx: HandlerContext, payload: Value| async move {
//!     println!("{payload}");
//!     anyhow::Ok(())
//! });
//! bus.publish_with_data("hello", "world").await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
pub mod bus;
pub mod error;
pub mod event;
pub mod executor;
pub mod handler;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use bus::{BusConfig, EventBus, ShutdownReport};
pub use error::{BusError, BusResult};
pub use event::{Event, EventId, Phase, UnitOfWork};
pub use executor::{Executor, Job, PooledExecutor};
pub use handler::{Handler, HandlerContext, NoopHandler};
pub use queue::{FifoQueue, TaskQueue};
pub use retry::{Backoff, DeadLetterSink, InMemoryDeadLetters, LogDeadLetter, RetryPolicy};
pub use scheduler::{QueueScheduler, Scheduler};
pub use storage::{InMemoryStorage, Storage};
