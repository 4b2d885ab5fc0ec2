//! # pipe 模块说明
//!
//! ## 角色定位（Why）
//! - 管道把一个可读端接到一个可写端上，并在两者之间自动传递背压：
//!   写入报告背压时暂停可读端，可写端 `drain` 后恢复；
//! - 管道还负责生命周期联动：上游结束时结束下游，任一侧出错或提前关闭时拆除管道并把错误传给对侧。
//!
//! ## 契约（What）
//! - 数据按上游产出顺序恰好转发一次；
//! - 拆除总是先移除管道注册的全部监听器，再传播错误，避免传播过程中再次进入管道回调；
//! - `unpipe()` 只拆除管道，不结束下游。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::config::PipeOptions;
use crate::error::StreamError;
use crate::event::{Flow, ListenerId};
use crate::readable::Readable;
use crate::writable::Writable;

/// 管道所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipeState {
    /// 正在转发。
    Active,
    /// 上游已结束，管道完成使命。
    Ended,
    /// 被显式解除，或下游已完成。
    Unpiped,
    /// 因错误或提前关闭而拆除。
    Errored,
}

struct PipeInner<C: Chunk> {
    source: Readable<C>,
    dest: Writable<C>,
    options: PipeOptions,
    forwarded: Cell<u64>,
    awaiting_drain: Cell<bool>,
    drain_listener: Cell<Option<ListenerId>>,
    state: Cell<PipeState>,
    source_listeners: RefCell<Vec<ListenerId>>,
    dest_listeners: RefCell<Vec<ListenerId>>,
}

/// 可读端到可写端的管道句柄。
///
/// 监听器持有管道状态的强引用，因此丢弃句柄不会中断转发；拆除后引用随监听器一起释放。
pub struct PipeLink<C: Chunk> {
    inner: Rc<PipeInner<C>>,
}

impl<C: Chunk> Clone for PipeLink<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// 建立管道。
///
/// # 教案式说明
/// - **意图 (Why)**：以一次调用完成“订阅数据 + 背压联动 + 结束联动 + 错误联动”；
/// - **执行逻辑 (How)**：
///   1. 在可读端注册 `data`、`end`、`error`、`close` 监听器，在可写端注册 `error`、`close`、`finish`；
///   2. `data` 回调中调用 `write`，返回未就绪时暂停可读端并（首次）注册 `drain` 监听器；
///   3. 若可写端此刻已处于背压则先暂停，否则恢复可读端的流动；
/// - **契约 (What)**：若可读端已派发过 `end`，结束动作在下一拍执行。
pub fn pipe<C>(source: &Readable<C>, dest: &Writable<C>, options: PipeOptions) -> PipeLink<C>
where
    C: Chunk + Clone,
{
    let inner = Rc::new(PipeInner {
        source: source.clone(),
        dest: dest.clone(),
        options,
        forwarded: Cell::new(0),
        awaiting_drain: Cell::new(false),
        drain_listener: Cell::new(None),
        state: Cell::new(PipeState::Active),
        source_listeners: RefCell::new(Vec::new()),
        dest_listeners: RefCell::new(Vec::new()),
    });
    source.attach_pipe();
    debug!(source = %source.label(), dest = %dest.label(), end = options.end, "pipe attached");

    let mut source_ids = Vec::new();
    if source.is_end_emitted() {
        let link = inner.clone();
        source.scheduler().defer(Box::new(move || link.on_source_end()));
    } else {
        let link = inner.clone();
        source_ids.push(source.on_end(move || link.on_source_end()));
    }
    {
        let link = inner.clone();
        source_ids.push(source.on_data(move |chunk: &C| link.on_data(chunk)));
    }
    {
        let link = inner.clone();
        source_ids.push(source.on_error(move |error| link.on_source_error(error)));
    }
    {
        let link = inner.clone();
        source_ids.push(source.on_close(move || link.on_source_close()));
    }
    *inner.source_listeners.borrow_mut() = source_ids;

    let mut dest_ids = Vec::new();
    {
        let link = inner.clone();
        dest_ids.push(dest.on_error(move |error| link.on_dest_error(error)));
    }
    {
        let link = inner.clone();
        dest_ids.push(dest.on_close(move || link.on_dest_close()));
    }
    {
        let link = inner.clone();
        dest_ids.push(dest.on_finish(move || link.on_dest_finish()));
    }
    *inner.dest_listeners.borrow_mut() = dest_ids;

    if dest.need_drain() {
        inner.pause_source();
    } else if source.flowing() != Some(true) {
        source.resume();
    }

    PipeLink { inner }
}

impl<C: Chunk + Clone> PipeInner<C> {
    fn is_active(&self) -> bool {
        self.state.get() == PipeState::Active
    }

    fn on_data(self: &Rc<Self>, chunk: &C) -> Flow {
        if !self.is_active() {
            return Flow::Continue;
        }
        self.forwarded.set(self.forwarded.get() + 1);
        let outcome = self.dest.write(chunk.clone());
        if !outcome.is_ready() {
            trace!(dest = %self.dest.label(), "pipe destination back-pressured");
            self.pause_source();
        }
        Flow::Continue
    }

    fn pause_source(self: &Rc<Self>) {
        self.awaiting_drain.set(true);
        self.source.pause();
        if self.drain_listener.get().is_none() {
            let link = self.clone();
            let id = self.dest.on_drain(move || link.on_drain());
            self.drain_listener.set(Some(id));
        }
    }

    fn on_drain(&self) {
        self.awaiting_drain.set(false);
        if self.is_active() && self.source.data_listener_count() > 0 {
            trace!(dest = %self.dest.label(), "pipe destination drained, resuming");
            self.source.resume();
        }
    }

    fn on_source_end(&self) {
        if !self.is_active() {
            return;
        }
        self.cleanup(PipeState::Ended);
        if self.options.end {
            self.dest.end();
        }
    }

    fn on_source_error(&self, error: &StreamError) {
        if !self.is_active() {
            return;
        }
        self.cleanup(PipeState::Errored);
        if self.options.propagate_errors {
            self.dest.destroy(Some(error.clone()));
        }
    }

    fn on_source_close(&self) {
        if !self.is_active() || self.source.is_end_emitted() {
            return;
        }
        self.cleanup(PipeState::Errored);
        if self.options.propagate_errors {
            self.dest.destroy(Some(StreamError::PrematureClose));
        }
    }

    fn on_dest_error(&self, error: &StreamError) {
        if !self.is_active() {
            return;
        }
        self.cleanup(PipeState::Errored);
        if self.options.propagate_errors {
            self.source.destroy(Some(error.clone()));
        }
    }

    fn on_dest_close(&self) {
        if !self.is_active() {
            return;
        }
        if self.dest.is_finished() {
            self.cleanup(PipeState::Unpiped);
            return;
        }
        self.cleanup(PipeState::Errored);
        if self.options.propagate_errors {
            self.source.destroy(Some(StreamError::PrematureClose));
        }
    }

    fn on_dest_finish(&self) {
        if self.is_active() {
            self.cleanup(PipeState::Unpiped);
        }
    }

    /// 移除管道注册的全部监听器并解除与可读端的绑定。
    fn cleanup(&self, next: PipeState) {
        self.state.set(next);
        let source_ids = std::mem::take(&mut *self.source_listeners.borrow_mut());
        for id in source_ids {
            self.source.remove_listener(id);
        }
        let dest_ids = std::mem::take(&mut *self.dest_listeners.borrow_mut());
        for id in dest_ids {
            self.dest.remove_listener(id);
        }
        if let Some(id) = self.drain_listener.take() {
            self.dest.remove_listener(id);
        }
        self.awaiting_drain.set(false);
        self.source.detach_pipe();
        debug!(
            source = %self.source.label(),
            dest = %self.dest.label(),
            forwarded = self.forwarded.get(),
            state = ?next,
            "pipe detached"
        );
    }
}

impl<C: Chunk + Clone> PipeLink<C> {
    /// 显式解除管道；不结束下游。
    pub fn unpipe(&self) {
        if self.inner.is_active() {
            self.inner.cleanup(PipeState::Unpiped);
        }
    }

    /// 已转发的数据单元个数。
    pub fn forwarded(&self) -> u64 {
        self.inner.forwarded.get()
    }

    /// 是否正在等待下游 `drain`。
    pub fn is_awaiting_drain(&self) -> bool {
        self.inner.awaiting_drain.get()
    }

    pub fn state(&self) -> PipeState {
        self.inner.state.get()
    }

    pub fn source(&self) -> &Readable<C> {
        &self.inner.source
    }

    pub fn destination(&self) -> &Writable<C> {
        &self.inner.dest
    }
}

impl<C: Chunk> fmt::Debug for PipeLink<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeLink")
            .field("source", &self.inner.source.label())
            .field("dest", &self.inner.dest.label())
            .field("forwarded", &self.inner.forwarded.get())
            .field("state", &self.inner.state.get())
            .finish()
    }
}
