//! 阻塞 FIFO 队列（TaskQueue）
//!
//! 调度器依赖的外部队列协议：非阻塞入队、空时等待的出队循环、显式关闭。
//! 关闭后出队循环立即返回，尚未出队的元素由 `close` 交还给调用方。
//!
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[async_trait]
pub trait TaskQueue<T: Send + 'static>: Send + Sync {
    /// 非阻塞入队；已关闭时原样返回元素
    fn push(&self, item: T) -> Result<(), T>;

    /// 取出队首元素，队列为空时等待；关闭后返回 `None`
    async fn pop(&self) -> Option<T>;

    /// 关闭队列，返回尚未出队的元素
    fn close(&self) -> Vec<T>;

    fn len(&self) -> usize;

    fn is_closed(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 逐个出队并调用 `f`，直至队列关闭
    async fn drain<F, Fut>(&self, mut f: F)
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        while let Some(item) = self.pop().await {
            f(item).await;
        }
    }
}

/// 无界 FIFO 队列
pub struct FifoQueue<T> {
    state: Mutex<FifoState<T>>,
    notify: Notify,
}

struct FifoState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FifoState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FifoState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> TaskQueue<T> for FifoQueue<T> {
    fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Option<T> {
        loop {
            // 先登记等待再检查状态，避免错过 close 的 notify_waiters
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    fn close(&self) -> Vec<T> {
        let abandoned = {
            let mut state = self.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.notify.notify_waiters();
        abandoned
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
