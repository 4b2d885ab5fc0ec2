//! # event 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎对外的通知（`data`、`end`、`drain`、`error`、`close` 等）都是“多订阅者 + 可在回调中增删订阅”的模式；
//! - 回调可能在派发过程中重入引擎、注册或移除监听器，因此派发必须基于快照，且不得在持有内部借用时调用。
//!
//! ## 契约（What）
//! - [`Listeners::snapshot`] 返回当前监听器的克隆列表并移除一次性监听器，调用方在释放借用后逐个调用；
//! - 派发期间被移除的监听器仍会收到本次通知，新增的监听器从下一次通知开始生效。

use std::rc::Rc;

/// 监听器句柄，用于 `remove_listener`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// 数据监听器的返回值：是否继续接收后续数据。
///
/// 监听器返回 `()` 或 `true` 等价于 [`Flow::Continue`]，返回 `false` 等价于 [`Flow::Pause`]。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flow {
    #[default]
    Continue,
    /// 在下一次出队之前暂停流动模式。
    Pause,
}

impl From<()> for Flow {
    fn from(_: ()) -> Self {
        Flow::Continue
    }
}

impl From<bool> for Flow {
    fn from(keep_flowing: bool) -> Self {
        if keep_flowing {
            Flow::Continue
        } else {
            Flow::Pause
        }
    }
}

struct Entry<F: ?Sized> {
    id: ListenerId,
    once: bool,
    callback: Rc<F>,
}

/// 单一事件的监听器列表。
pub(crate) struct Listeners<F: ?Sized> {
    entries: Vec<Entry<F>>,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn add(&mut self, id: ListenerId, callback: Rc<F>, once: bool) {
        self.entries.push(Entry { id, once, callback });
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// 克隆当前监听器并移除其中的一次性监听器。
    pub(crate) fn snapshot(&mut self) -> Vec<Rc<F>> {
        let snapshot = self
            .entries
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        self.entries.retain(|entry| !entry.once);
        snapshot
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// 单调递增的监听器编号分配器。
#[derive(Debug, Default)]
pub(crate) struct ListenerIds {
    next: u64,
}

impl ListenerIds {
    pub(crate) fn allocate(&mut self) -> ListenerId {
        self.next += 1;
        ListenerId(self.next)
    }
}
