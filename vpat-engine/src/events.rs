use std::collections::BTreeMap;
use std::fmt;

use vpat_core::document::EntityId;

/// 引擎对外发布的通知。批量操作只发一次聚合事件。
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// 每次成功的 push/undo/redo 恰好一次，供标题栏、自动保存、列表刷新统一消费。
    DocumentChanged,
    ActiveBlockChanged { index: usize, name: String },
    GroupsChanged,
    GroupVisibilityChanged(BTreeMap<EntityId, bool>),
    Status(String),
    ConsistencyWarning(String),
    FullReparse,
}

pub type ObserverId = usize;

type Observer = Box<dyn FnMut(&DocumentEvent)>;

/// 显式的观察者列表，按订阅顺序同步分发。
#[derive(Default)]
pub struct EventBus {
    observers: Vec<(ObserverId, Observer)>,
    next_id: ObserverId,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&DocumentEvent) + 'static) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        before != self.observers.len()
    }

    pub fn emit(&mut self, event: DocumentEvent) {
        for (_, observer) in &mut self.observers {
            observer(&event);
        }
    }

    #[inline]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}
