//! # tick 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎里所有“下一拍再做”的动作（`error`/`close` 事件、`resume` 排空、同步完成的写入确认）
//!   都需要一个单线程协作式任务队列；若直接绑定某个运行时，测试将无法精确控制每一拍；
//! - 因此以 [`Scheduler`] trait 注入调度能力，生产环境可以桥接到任意事件循环，
//!   测试使用确定性的 [`TickQueue`] 逐拍推进。
//!
//! ## 契约（What）
//! - `defer` 的任务按 FIFO 顺序在之后的某一拍执行，绝不在调用栈内同步执行；
//! - `spawn_local` 登记的 Future 在其 waker 被触发后的下一拍被重新轮询；
//! - 调度器不跨线程，引擎因此以 `Rc`/`RefCell` 组织状态。

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::task::{ArcWake, waker};
use tracing::trace;

/// 延后执行的任务。
pub type Task = Box<dyn FnOnce() + 'static>;

/// 由调度器托管的本地 Future。
pub type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// 引擎持有调度器的共享形态。
pub type SharedScheduler = Rc<dyn Scheduler>;

/// 可注入的单线程调度器。
///
/// # 设计背景（Why）
/// - 引擎需要“下一拍”语义来打断重入链：同步回调中触发的事件若立即派发，会让调用方在自己的栈帧里
///   观察到不一致的中间状态；
/// - 通过 trait 注入，引擎不感知具体运行时，与 `Clock` 抽象同样的思路。
///
/// # 接口约束（What）
/// - `defer`：登记一个任务，保证在当前调用栈返回之后才执行，且多个任务保持 FIFO；
/// - `spawn_local`：托管一个 `!Send` 的 Future，由调度器在被唤醒后轮询直至完成。
pub trait Scheduler {
    /// 登记下一拍执行的任务。
    fn defer(&self, task: Task);

    /// 托管一个本地 Future。
    fn spawn_local(&self, future: LocalFuture);
}

/// 确定性的参考调度器。
///
/// # 教案式说明
/// - **意图 (Why)**：测试与基准需要逐拍观察引擎行为，例如“`close` 必须晚于 `destroy` 调用一拍”；
/// - **契约 (What)**：
///   - 一拍 = 执行一个 `defer` 任务；任务队列为空时，一拍 = 轮询所有已被唤醒的本地 Future；
///   - `run_until_idle` 持续推进直到既无任务也无被唤醒的 Future；
///   - `block_on` 交替轮询目标 Future 与推进队列，队列停滞且目标仍未完成时返回 `None`；
/// - **执行逻辑 (How)**：任务存放在 `RefCell<VecDeque>`；Future 的 waker 基于 `Arc<AtomicBool>`，
///   满足 `Waker: Send + Sync` 的要求，同时让单线程队列只需检查标志位；
/// - **设计权衡 (Trade-offs)**：轮询本地 Future 时会整体取出列表再放回，期间新登记的 Future
///   会追加到列表尾部，不会与正在轮询的集合互相借用。
#[derive(Clone, Default)]
pub struct TickQueue {
    inner: Rc<TickInner>,
}

#[derive(Default)]
struct TickInner {
    tasks: RefCell<VecDeque<Task>>,
    futures: RefCell<Vec<Spawned>>,
    ticks: Cell<u64>,
}

struct Spawned {
    future: LocalFuture,
    flag: Arc<WakeFlag>,
}

#[derive(Default)]
struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn armed() -> Arc<Self> {
        Arc::new(WakeFlag(AtomicBool::new(true)))
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::Release);
    }
}

impl TickQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以共享调度器形态导出自身，供引擎构造函数注入。
    pub fn handle(&self) -> SharedScheduler {
        Rc::new(self.clone())
    }

    /// 待执行任务数与已唤醒 Future 数之和。
    pub fn pending(&self) -> usize {
        let woken = self
            .inner
            .futures
            .borrow()
            .iter()
            .filter(|spawned| spawned.flag.is_set())
            .count();
        self.inner.tasks.borrow().len() + woken
    }

    /// 已执行的拍数。
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    /// 推进一拍；没有可做的事情时返回 `false`。
    pub fn run_once(&self) -> bool {
        let task = self.inner.tasks.borrow_mut().pop_front();
        if let Some(task) = task {
            self.inner.ticks.set(self.inner.ticks.get() + 1);
            task();
            return true;
        }
        self.poll_woken_futures()
    }

    /// 持续推进直到队列空闲，返回本次执行的拍数。
    pub fn run_until_idle(&self) -> u64 {
        let start = self.ticks();
        while self.run_once() {}
        let ran = self.ticks() - start;
        trace!(ticks = ran, "tick queue idle");
        ran
    }

    /// 驱动 `future` 直到完成；若队列停滞而 Future 仍未完成，返回 `None`。
    pub fn block_on<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut future = std::pin::pin!(future);
        let flag = WakeFlag::armed();
        let waker = waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if flag.take() {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Some(output);
                }
            }
            if !self.run_once() && !flag.is_set() {
                return None;
            }
        }
    }

    fn poll_woken_futures(&self) -> bool {
        let mut spawned = std::mem::take(&mut *self.inner.futures.borrow_mut());
        if !spawned.iter().any(|entry| entry.flag.is_set()) {
            self.restore_futures(spawned);
            return false;
        }

        self.inner.ticks.set(self.inner.ticks.get() + 1);
        spawned.retain_mut(|entry| {
            if !entry.flag.take() {
                return true;
            }
            let waker = waker(entry.flag.clone());
            let mut cx = Context::from_waker(&waker);
            entry.future.as_mut().poll(&mut cx).is_pending()
        });
        self.restore_futures(spawned);
        true
    }

    fn restore_futures(&self, mut spawned: Vec<Spawned>) {
        let mut slot = self.inner.futures.borrow_mut();
        spawned.append(&mut slot);
        *slot = spawned;
    }
}

impl Scheduler for TickQueue {
    fn defer(&self, task: Task) {
        self.inner.tasks.borrow_mut().push_back(task);
    }

    fn spawn_local(&self, future: LocalFuture) {
        self.inner.futures.borrow_mut().push(Spawned {
            future,
            flag: WakeFlag::armed(),
        });
    }
}

impl fmt::Debug for TickQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickQueue")
            .field("tasks", &self.inner.tasks.borrow().len())
            .field("futures", &self.inner.futures.borrow().len())
            .field("ticks", &self.inner.ticks.get())
            .finish()
    }
}
