//! 传输层事件订阅表
//!
//! 订阅返回不透明的 [`HookToken`]，用它取消订阅。回调在锁外执行，
//! 回调内部可以安全地再次订阅或取消订阅。

use crate::im::transport::TransportEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type HookHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken(u64);

#[derive(Default)]
pub struct TransportHooks {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HookToken, HookHandler)>>,
}

impl TransportHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, handler: F) -> HookToken
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let token = HookToken(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        match self.handlers.lock() {
            Ok(mut handlers) => handlers.push((token, Arc::new(handler))),
            Err(_) => warn!("[Transport] 订阅表锁已损坏，订阅被忽略"),
        }
        token
    }

    /// 取消订阅，返回该 token 是否存在
    pub fn remove(&self, token: HookToken) -> bool {
        let Ok(mut handlers) = self.handlers.lock() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != before
    }

    pub fn emit(&self, event: &TransportEvent) {
        let snapshot: Vec<HookHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
