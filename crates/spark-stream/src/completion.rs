//! # completion 模块说明
//!
//! ## 角色定位（Why）
//! - 回调式“完成通知”容易出现漏调、重复调用与乱序三类问题；这里把它们拆成两种类型：
//!   - [`Done`]：交给源/汇实现者的一次性句柄，`complete` 消费自身，“恰好一次”由类型系统保证；
//!   - [`Completion`]：交给调用方的 Future，可多次克隆、可 `.await`、也可同步查询结果；
//! - [`CompletionQueue`] 按写入序号重排确认结果，保证写入完成严格按写入顺序对外可见。
//!
//! ## 契约（What）
//! - `Done` 被丢弃而未调用 `complete` 时，按构造时给定的回退结果完成；
//! - `Completion` 只接受第一次结算，之后的结算被忽略；
//! - 结算回调在释放内部借用后执行，允许回调重入引擎。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::StreamError;

/// 结算结果。
pub type Outcome = Result<(), StreamError>;

type Settle = Box<dyn FnOnce(Outcome) + 'static>;

/// 一次性完成句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：汇的 `dispatch`、`finish` 与源/汇的 `destroy` 都可能异步完成，
///   实现者需要把“完成”这件事带到任意时刻执行；
/// - **契约 (What)**：
///   - [`Done::complete`] 消费句柄，只能调用一次；
///   - 句柄被丢弃时以回退结果完成：写入句柄回退为汇失败，销毁句柄回退为成功；
///   - 句柄是 `'static` 的，可以移动进闭包或本地 Future；
/// - **风险 (Trade-offs)**：句柄完成会同步回到引擎，若实现者在持有自身可变借用时完成，
///   需确保引擎回调不会再次借用同一对象。
pub struct Done {
    settle: Option<Settle>,
    fallback: fn() -> Outcome,
}

impl Done {
    pub(crate) fn new(settle: impl FnOnce(Outcome) + 'static, fallback: fn() -> Outcome) -> Self {
        Self {
            settle: Some(Box::new(settle)),
            fallback,
        }
    }

    /// 以给定结果完成。
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(settle) = self.settle.take() {
            settle(outcome);
        }
    }

    /// 以成功完成。
    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    /// 以失败完成。
    pub fn fail(self, error: StreamError) {
        self.complete(Err(error));
    }

    pub(crate) fn dropped_write() -> Outcome {
        Err(StreamError::sink_failed(
            "write completion dropped without being completed",
        ))
    }

    pub(crate) fn dropped_finish() -> Outcome {
        Err(StreamError::sink_failed(
            "finish completion dropped without being completed",
        ))
    }

    pub(crate) fn dropped_destroy() -> Outcome {
        Ok(())
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle((self.fallback)());
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("pending", &self.settle.is_some())
            .finish()
    }
}

type Observer = Box<dyn FnOnce(&Outcome) + 'static>;

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    wakers: Vec<Waker>,
    observers: Vec<Observer>,
}

/// 可等待的完成结果。
///
/// # 教案式说明
/// - **意图 (Why)**：写入、结束、管道完成等操作都需要向调用方返回“稍后才知道”的结果；
///   以 Future 表达可以直接 `.await`，测试中也能在推进调度器后同步查询；
/// - **契约 (What)**：
///   - 输出为 `Result<(), StreamError>`；
///   - 克隆共享同一结果槽；任一克隆被轮询都会登记自己的 waker；
///   - [`Completion::on_settled`] 注册的观察者在结算时按注册顺序调用，已结算时立即调用；
/// - **设计权衡 (Trade-offs)**：结果槽基于 `Rc<RefCell>`，因此 `Completion` 为 `!Send`，
///   与引擎的单线程模型一致。
#[derive(Clone, Default)]
pub struct Completion {
    slot: Rc<RefCell<Slot>>,
}

impl Completion {
    pub(crate) fn pending() -> Self {
        Self::default()
    }

    pub(crate) fn settled(outcome: Outcome) -> Self {
        let completion = Self::pending();
        completion.resolve(outcome);
        completion
    }

    /// 结算；已结算时返回 `false` 并忽略本次结果。
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        let (wakers, observers) = {
            let mut slot = self.slot.borrow_mut();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut slot.wakers),
                std::mem::take(&mut slot.observers),
            )
        };
        for observer in observers {
            observer(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// 是否已结算。
    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// 已结算时返回结果的克隆。
    pub fn outcome(&self) -> Option<Outcome> {
        self.slot.borrow().outcome.clone()
    }

    /// 注册结算观察者。
    pub fn on_settled(&self, observer: impl FnOnce(&Outcome) + 'static) {
        let ready = self.slot.borrow().outcome.clone();
        match ready {
            Some(outcome) => observer(&outcome),
            None => self.slot.borrow_mut().observers.push(Box::new(observer)),
        }
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match &slot.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("outcome", &self.slot.borrow().outcome)
            .finish()
    }
}

struct Ticket {
    sequence: u64,
    completion: Completion,
    outcome: Option<Outcome>,
}

/// 按写入序号重排的确认队列。
///
/// # 契约说明（What）
/// - `register` 的序号必须单调递增；
/// - `settle` 标记某个序号的结果，并返回“队首连续已结算”的一段，调用方在释放借用后逐个结算；
/// - 某个序号的结果只记录第一次。
#[derive(Default)]
pub(crate) struct CompletionQueue {
    tickets: VecDeque<Ticket>,
}

impl CompletionQueue {
    pub(crate) fn register(&mut self, sequence: u64, completion: Completion) {
        debug_assert!(
            self.tickets
                .back()
                .is_none_or(|last| last.sequence < sequence),
            "写入序号必须单调递增"
        );
        self.tickets.push_back(Ticket {
            sequence,
            completion,
            outcome: None,
        });
    }

    pub(crate) fn settle(&mut self, sequence: u64, outcome: Outcome) -> Vec<(Completion, Outcome)> {
        if let Ok(index) = self
            .tickets
            .binary_search_by_key(&sequence, |ticket| ticket.sequence)
        {
            let ticket = &mut self.tickets[index];
            if ticket.outcome.is_none() {
                ticket.outcome = Some(outcome);
            }
        }
        self.release()
    }

    fn release(&mut self) -> Vec<(Completion, Outcome)> {
        let mut ready = Vec::new();
        while self
            .tickets
            .front()
            .is_some_and(|ticket| ticket.outcome.is_some())
        {
            if let Some(Ticket {
                completion,
                outcome: Some(outcome),
                ..
            }) = self.tickets.pop_front()
            {
                ready.push((completion, outcome));
            }
        }
        ready
    }

    pub(crate) fn len(&self) -> usize {
        self.tickets.len()
    }
}

/// 在无借用的上下文中批量结算。
pub(crate) fn resolve_all(ready: Vec<(Completion, Outcome)>) {
    for (completion, outcome) in ready {
        completion.resolve(outcome);
    }
}
