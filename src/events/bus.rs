//! 事件总线
//!
//! - 事件名大小写不敏感
//! - 同名监听者按注册顺序调用
//! - 任一监听者返回 `EventFlow::Stop` 即视为事件被否决
//! - 除通配通道外，每个事件都会再投递一次到通配通道（`catchAll` / `*`）

use super::SessionEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 通配通道名称
pub const CATCH_ALL: &str = "catchall";

/// 监听者返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    /// 继续
    Continue,
    /// 否决事件
    Stop,
}

/// 监听者 ID，用于注销
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) -> EventFlow + Send + Sync>;

/// 事件总线
pub struct EventBus {
    /// 事件名（小写） -> 监听者列表
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// 规范化事件名：小写，`*` 视为通配通道
    fn normalize(name: &str) -> String {
        let name = name.trim().to_lowercase();
        if name == "*" {
            CATCH_ALL.to_string()
        } else {
            name
        }
    }

    /// 注册监听者
    pub fn on<F>(&self, name: &str, callback: F) -> ListenerId
    where
        F: Fn(&SessionEvent) -> EventFlow + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .entry(Self::normalize(name))
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// 注销单个监听者
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let key = Self::normalize(name);
        let removed = match self.listeners.get_mut(&key) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(lid, _)| *lid != id);
                before != entry.len()
            }
            None => false,
        };
        self.listeners.remove_if(&key, |_, v| v.is_empty());
        removed
    }

    /// 注销某事件的全部监听者；`None` 表示清空所有事件
    pub fn off_all(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.listeners.remove(&Self::normalize(name));
            }
            None => self.listeners.clear(),
        }
    }

    /// 某事件当前的监听者数量
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .get(&Self::normalize(name))
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// 分发事件
    ///
    /// 返回 true 表示事件未被否决
    pub fn fire(&self, event: &SessionEvent) -> bool {
        let mut stopped = self.dispatch(&Self::normalize(event.name()), event);
        stopped = self.dispatch(CATCH_ALL, event) || stopped;
        !stopped
    }

    /// 调用某个通道的监听者，返回是否有监听者否决
    fn dispatch(&self, key: &str, event: &SessionEvent) -> bool {
        // 先复制监听者列表再调用，回调内部可以重新注册监听者
        let callbacks: Vec<Listener> = match self.listeners.get(key) {
            Some(entry) => entry.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return false,
        };

        let mut stopped = false;
        for callback in callbacks {
            if callback(event) == EventFlow::Stop {
                stopped = true;
            }
        }
        stopped
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.listeners.len())
            .finish()
    }
}
