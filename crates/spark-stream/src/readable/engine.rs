use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use super::state::{
    EofEffect, PushEffect, ReadStart, ReadableListenerEffect, ReadablePhase, ReadableState,
};
use crate::buffer::ChunkBuffer;
use crate::chunk::Chunk;
use crate::completion::{Done, Outcome};
use crate::config::ReadableOptions;
use crate::error::StreamError;
use crate::event::{Flow, ListenerId, ListenerIds, Listeners};
use crate::state::StateAdvance;
use crate::tick::SharedScheduler;

/// 数据生产者接口。
///
/// # 教案式说明
/// - **意图 (Why)**：引擎按需向生产者“索取”数据，而不是由生产者无节制地推送；
///   `produce` 的调用时机完全由引擎根据缓冲水位决定；
/// - **契约 (What)**：
///   - `produce(controller, size)`：`size` 为建议的产出量（当前高水位）。同一时刻至多一次未应答的调用；
///     实现者之后必须通过 `controller` 推送数据、推送结束标记或报告错误，可以同步也可以异步；
///   - `destroy(error, done)`：释放资源并完成 `done`，默认实现立即完成；
/// - **风险 (Trade-offs)**：`produce` 期间源对象被引擎暂时取出，此时的重入索取会被推迟到下一拍。
pub trait Source<C: Chunk> {
    /// 引擎请求更多数据。
    fn produce(&mut self, controller: &ReadableController<C>, size: usize);

    /// 引擎被销毁，释放资源。
    fn destroy(&mut self, error: Option<&StreamError>, done: Done) {
        let _ = error;
        done.succeed();
    }
}

/// 不主动产出数据的源，数据完全由外部经控制器推送。
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualSource;

impl<C: Chunk> Source<C> for ManualSource {
    fn produce(&mut self, _controller: &ReadableController<C>, _size: usize) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitEvent {
    Readable,
    End,
    Close,
    Pause,
    Resume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventKind {
    Data,
    Unit(UnitEvent),
    Error,
    Destroy,
}

struct Events<C: Chunk> {
    data: Listeners<dyn Fn(&C) -> Flow>,
    readable: Listeners<dyn Fn()>,
    end: Listeners<dyn Fn()>,
    close: Listeners<dyn Fn()>,
    pause: Listeners<dyn Fn()>,
    resume: Listeners<dyn Fn()>,
    error: Listeners<dyn Fn(&StreamError)>,
    destroy: Listeners<dyn Fn(Option<&StreamError>)>,
}

impl<C: Chunk> Default for Events<C> {
    fn default() -> Self {
        Self {
            data: Listeners::default(),
            readable: Listeners::default(),
            end: Listeners::default(),
            close: Listeners::default(),
            pause: Listeners::default(),
            resume: Listeners::default(),
            error: Listeners::default(),
            destroy: Listeners::default(),
        }
    }
}

impl<C: Chunk> Events<C> {
    fn unit(&mut self, event: UnitEvent) -> &mut Listeners<dyn Fn()> {
        match event {
            UnitEvent::Readable => &mut self.readable,
            UnitEvent::End => &mut self.end,
            UnitEvent::Close => &mut self.close,
            UnitEvent::Pause => &mut self.pause,
            UnitEvent::Resume => &mut self.resume,
        }
    }

    fn remove(&mut self, id: ListenerId) -> Option<EventKind> {
        if self.data.remove(id) {
            return Some(EventKind::Data);
        }
        for event in [
            UnitEvent::Readable,
            UnitEvent::End,
            UnitEvent::Close,
            UnitEvent::Pause,
            UnitEvent::Resume,
        ] {
            if self.unit(event).remove(id) {
                return Some(EventKind::Unit(event));
            }
        }
        if self.error.remove(id) {
            return Some(EventKind::Error);
        }
        if self.destroy.remove(id) {
            return Some(EventKind::Destroy);
        }
        None
    }

    fn clear(&mut self) {
        self.data.clear();
        self.readable.clear();
        self.end.clear();
        self.close.clear();
        self.pause.clear();
        self.resume.clear();
        self.error.clear();
        self.destroy.clear();
    }
}

struct Core<C: Chunk> {
    state: ReadableState,
    buffer: ChunkBuffer<C>,
    events: Events<C>,
    ids: ListenerIds,
    error: Option<StreamError>,
    destroy_deferred: bool,
    pipes: usize,
    auto_destroy_guard: Option<Rc<dyn Fn() -> bool>>,
}

impl<C: Chunk> Core<C> {
    fn record_error(&mut self, error: &StreamError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.state.errored = true;
    }
}

struct Inner<C: Chunk> {
    core: RefCell<Core<C>>,
    source: RefCell<Option<Box<dyn Source<C>>>>,
    source_busy: Cell<bool>,
    scheduler: SharedScheduler,
    label: Rc<str>,
}

/// 可读引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：把“生产者推入、消费者取出”之间的缓冲、背压与两种消费协议（流动 / 暂停）
///   封装为一个可克隆句柄，生产者与消费者都不需要阻塞线程；
/// - **契约 (What)**：
///   - `push` 返回 `false` 表示缓冲已达高水位，守规矩的生产者应停止推送直到下一次 `produce`；
///   - 流动模式下数据按推送顺序投递给 `data` 监听器；暂停模式下由 `read()` 拉取；
///   - 所有事件回调都在内部借用释放后调用，回调中可以任意重入 `read`/`pause`/`resume`/`destroy`；
///   - `error`、`close`、`end` 事件总是在之后的某一拍派发，绝不在触发它们的调用栈内同步派发；
/// - **执行逻辑 (How)**：状态决策由 [`ReadableState`] 的转换函数给出，引擎负责缓冲操作、
///   调用源与派发事件；需要“下一拍”的动作经注入的调度器登记；
/// - **设计权衡 (Trade-offs)**：句柄基于 `Rc`，因此为 `!Send`；监听器若捕获引擎句柄会形成引用环，
///   引擎在派发 `close` 后清空全部监听器以打破环。
pub struct Readable<C: Chunk> {
    inner: Rc<Inner<C>>,
}

impl<C: Chunk> Clone for Readable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Chunk> Readable<C> {
    /// 以给定源、配置与调度器创建可读引擎。
    pub fn new<S>(source: S, options: ReadableOptions, scheduler: SharedScheduler) -> Self
    where
        S: Source<C> + 'static,
    {
        let high_water_mark = options.resolve_high_water_mark(C::MODE);
        let state = ReadableState::new(
            C::MODE,
            high_water_mark,
            options.overflow,
            options.auto_destroy,
            options.emit_close,
        );
        let label: Rc<str> = Rc::from(options.label.as_deref().unwrap_or("readable"));
        trace!(stream = %label, high_water_mark, mode = ?C::MODE, "readable created");
        Self {
            inner: Rc::new(Inner {
                core: RefCell::new(Core {
                    state,
                    buffer: ChunkBuffer::new(high_water_mark),
                    events: Events::default(),
                    ids: ListenerIds::default(),
                    error: None,
                    destroy_deferred: false,
                    pipes: 0,
                    auto_destroy_guard: None,
                }),
                source: RefCell::new(Some(Box::new(source))),
                source_busy: Cell::new(false),
                scheduler,
                label,
            }),
        }
    }

    /// 创建完全由外部推送驱动的可读引擎。
    pub fn manual(options: ReadableOptions, scheduler: SharedScheduler) -> Self {
        Self::new(ManualSource, options, scheduler)
    }

    /// 获取推送控制器。
    pub fn controller(&self) -> ReadableController<C> {
        ReadableController {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn scheduler(&self) -> SharedScheduler {
        self.inner.scheduler.clone()
    }

    fn core(&self) -> Ref<'_, Core<C>> {
        self.inner.core.borrow()
    }

    fn core_mut(&self) -> RefMut<'_, Core<C>> {
        self.inner.core.borrow_mut()
    }

    fn schedule(&self, task: impl FnOnce(&Readable<C>) + 'static) {
        let this = self.clone();
        self.inner.scheduler.defer(Box::new(move || task(&this)));
    }

    // ---- 生产者侧 ----

    /// 推送一个数据单元；返回是否还欢迎更多数据。
    pub fn push(&self, chunk: C) -> bool {
        self.add_chunk(chunk, false)
    }

    /// 把数据单元放回缓冲队首，供下一次 `read` 优先取出。
    pub fn unshift(&self, chunk: C) -> bool {
        self.add_chunk(chunk, true)
    }

    /// 推送结束标记。
    pub fn end(&self) {
        let effect = self.core_mut().state.on_eof();
        match effect {
            EofEffect::Ignore | EofEffect::None => {}
            EofEffect::ScheduleReadable => self.schedule(Self::emit_readable_tick),
            EofEffect::EmitReadableNow => self.emit_readable_tick(),
        }
        if effect != EofEffect::Ignore {
            debug!(stream = %self.inner.label, "end of stream pushed");
        }
    }

    fn add_chunk(&self, chunk: C, front: bool) -> bool {
        let size = chunk.size();
        let mut pending = Some(chunk);
        let effect = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let has_data_listeners = !core.events.data.is_empty();
            let effect = core.state.on_push(size, front, has_data_listeners);
            if matches!(effect, PushEffect::Buffer { .. }) {
                if let Some(chunk) = pending.take() {
                    if front {
                        core.buffer.enqueue_front(chunk);
                    } else {
                        core.buffer.enqueue(chunk);
                    }
                }
            }
            debug_assert_eq!(core.state.length, core.buffer.peek_length());
            effect
        };

        match effect {
            PushEffect::Deliver => {
                trace!(stream = %self.inner.label, size, "chunk delivered directly");
                if let Some(chunk) = pending.take() {
                    self.emit_data(&chunk);
                }
                self.maybe_read_more();
            }
            PushEffect::Buffer { schedule_readable } => {
                trace!(stream = %self.inner.label, size, front, "chunk buffered");
                if schedule_readable {
                    self.schedule(Self::emit_readable_tick);
                }
                self.maybe_read_more();
            }
            PushEffect::Skip => {
                if !front {
                    self.maybe_read_more();
                }
            }
            PushEffect::Drop => return false,
            PushEffect::Reject(error) => {
                warn!(stream = %self.inner.label, code = error.code(), "push rejected");
                self.error_or_destroy(error);
                return false;
            }
        }
        self.core().state.can_push_more()
    }

    // ---- 消费者侧 ----

    /// 拉取数据。
    ///
    /// - `None`：流动模式下取一个单元，暂停模式下取出全部缓冲（对象模式始终一个）；
    /// - `Some(0)`：只触发索取或 `readable` 通知，不取数据；
    /// - `Some(n)`：取恰好 `n` 个计量单位，不足且未结束时返回 `None`；`n` 超过高水位时水位被抬升。
    pub fn read(&self, size: Option<usize>) -> Option<C> {
        let start = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let start = core.state.begin_read(size, core.buffer.first_size());
            core.buffer.set_high_water_mark(core.state.high_water_mark);
            start
        };

        let (mut want, produce) = match start {
            ReadStart::Proceed { want, produce } => (want, produce),
            ReadStart::EndNow => {
                self.end_readable();
                return None;
            }
            ReadStart::NotifyReadable { schedule } => {
                if schedule {
                    self.schedule(Self::emit_readable_tick);
                }
                return None;
            }
            ReadStart::Exhausted { end_now } => {
                if end_now {
                    self.end_readable();
                }
                return None;
            }
            ReadStart::Invalid(error) => {
                warn!(stream = %self.inner.label, code = error.code(), "read size rejected");
                self.error_or_destroy(error);
                return None;
            }
        };

        if produce {
            let high_water_mark = self.core().state.high_water_mark;
            self.call_produce(high_water_mark);
            let mut guard = self.core_mut();
            let core = &mut *guard;
            want = core
                .state
                .after_produce(size, want, core.buffer.first_size());
        }

        let (chunk, finish) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let chunk = if want > 0 {
                core.buffer.dequeue(want)
            } else {
                None
            };
            let finish = core.state.finish_read(size, chunk.as_ref().map(Chunk::size));
            debug_assert_eq!(core.state.length, core.buffer.peek_length());
            (chunk, finish)
        };

        if finish.end_now {
            self.end_readable();
        }
        if let Some(chunk) = &chunk {
            if finish.emit_data {
                self.emit_data(chunk);
            }
        }
        chunk
    }

    /// 切换到流动模式；实际排空在下一拍开始。
    pub fn resume(&self) {
        let schedule = self.core_mut().state.resume();
        if schedule {
            debug!(stream = %self.inner.label, "resume scheduled");
            self.schedule(Self::resume_tick);
        }
    }

    /// 切换到暂停模式；在 `data` 监听器中调用时，下一次出队前生效。
    pub fn pause(&self) {
        let before = self.phase();
        let emit = self.core_mut().state.pause();
        if emit {
            let advance = StateAdvance::between(before, self.phase());
            debug!(stream = %self.inner.label, ?advance, "readable paused");
            self.emit_unit(UnitEvent::Pause);
        }
    }

    /// 是否处于暂停。
    pub fn is_paused(&self) -> bool {
        self.core().state.is_paused()
    }

    /// 流动标志：`None` 尚未选择，`Some(true)` 流动，`Some(false)` 暂停。
    pub fn flowing(&self) -> Option<bool> {
        self.core().state.flowing
    }

    /// 销毁引擎：丢弃缓冲，调用源的 `destroy`，之后的某一拍派发 `error`（如有）与 `close`。
    ///
    /// 重复调用无效果；首次调用的错误会被保留。
    pub fn destroy(&self, error: Option<StreamError>) {
        let hooks = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state.destroyed {
                return;
            }
            let before = core.state.phase();
            if let Some(error) = &error {
                core.record_error(error);
            }
            core.state.destroyed = true;
            let dropped = core.buffer.clear();
            core.state.length = 0;
            let advance = StateAdvance::between(before, core.state.phase());
            debug!(
                stream = %self.inner.label,
                dropped,
                code = error.as_ref().map(StreamError::code),
                ?advance,
                "readable destroyed"
            );
            core.events.destroy.snapshot()
        };
        for hook in hooks {
            hook(error.as_ref());
        }
        self.release_source(error);
    }

    // ---- 事件 ----

    /// 注册 `data` 监听器；若未显式暂停，引擎进入流动模式。
    pub fn on_data<F, R>(&self, listener: F) -> ListenerId
    where
        F: Fn(&C) -> R + 'static,
        R: Into<Flow>,
    {
        let (id, resume) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let id = core.ids.allocate();
            let callback: Rc<dyn Fn(&C) -> Flow> = Rc::new(move |chunk: &C| listener(chunk).into());
            core.events.data.add(id, callback, false);
            core.state.readable_listening = !core.events.readable.is_empty();
            (id, core.state.flowing != Some(false))
        };
        if resume {
            self.resume();
        }
        id
    }

    /// 注册 `readable` 监听器；引擎切换到暂停模式，由消费者在通知后调用 `read()`。
    pub fn on_readable(&self, listener: impl Fn() + 'static) -> ListenerId {
        let (id, effect) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let id = core.ids.allocate();
            core.events.readable.add(id, Rc::new(listener), false);
            (id, core.state.on_readable_listener())
        };
        match effect {
            ReadableListenerEffect::ScheduleReadable => self.schedule(Self::emit_readable_tick),
            ReadableListenerEffect::ScheduleRead => self.schedule(|this| {
                this.read(Some(0));
            }),
            ReadableListenerEffect::None => {}
        }
        id
    }

    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::End, Rc::new(listener))
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Close, Rc::new(listener))
    }

    pub fn on_pause(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Pause, Rc::new(listener))
    }

    pub fn on_resume(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Resume, Rc::new(listener))
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.error.add(id, Rc::new(listener), false);
        id
    }

    /// 移除监听器；返回是否找到。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.core_mut().events.remove(id);
        if removed == Some(EventKind::Unit(UnitEvent::Readable)) {
            self.schedule(Self::update_readable_listening);
        }
        removed.is_some()
    }

    pub(crate) fn on_destroy(&self, hook: impl Fn(Option<&StreamError>) + 'static) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.destroy.add(id, Rc::new(hook), false);
        id
    }

    pub(crate) fn set_auto_destroy_guard(&self, guard: Rc<dyn Fn() -> bool>) {
        self.core_mut().auto_destroy_guard = Some(guard);
    }

    pub(crate) fn attach_pipe(&self) {
        self.core_mut().pipes += 1;
    }

    /// 解除一条管道；最后一条管道解除且引擎仍在运行时暂停引擎。
    pub(crate) fn detach_pipe(&self) {
        let pause = {
            let mut core = self.core_mut();
            core.pipes = core.pipes.saturating_sub(1);
            core.pipes == 0 && !core.state.end_emitted && !core.state.destroyed
        };
        if pause {
            self.pause();
        }
    }

    fn add_unit(&self, event: UnitEvent, listener: Rc<dyn Fn()>) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.unit(event).add(id, listener, false);
        id
    }

    // ---- 观察 ----

    /// 缓冲中的计量单位数。
    pub fn readable_length(&self) -> usize {
        self.core().state.length
    }

    pub fn high_water_mark(&self) -> usize {
        self.core().state.high_water_mark
    }

    /// 是否已收到结束标记。
    pub fn is_ended(&self) -> bool {
        self.core().state.ended
    }

    /// `end` 事件是否已派发。
    pub fn is_end_emitted(&self) -> bool {
        self.core().state.end_emitted
    }

    pub fn is_destroyed(&self) -> bool {
        self.core().state.destroyed
    }

    pub fn is_errored(&self) -> bool {
        self.core().state.errored
    }

    /// `close` 事件是否已派发（或在禁用 `close` 时已到达派发时机）。
    pub fn is_closed(&self) -> bool {
        self.core().state.close_emitted
    }

    /// 首个记录的错误。
    pub fn error(&self) -> Option<StreamError> {
        self.core().error.clone()
    }

    /// 是否曾派发过 `data`。
    pub fn did_read(&self) -> bool {
        self.core().state.data_emitted
    }

    /// 是否仍可读取：未销毁、未出错、`end` 未派发。
    pub fn readable(&self) -> bool {
        let state = self.core().state;
        !state.destroyed && !state.errored && !state.end_emitted
    }

    /// 状态快照。
    pub fn state(&self) -> ReadableState {
        self.core().state
    }

    pub fn phase(&self) -> ReadablePhase {
        self.core().state.phase()
    }

    pub(crate) fn data_listener_count(&self) -> usize {
        self.core().events.data.len()
    }

    // ---- 内部流程 ----

    fn call_produce(&self, size: usize) {
        let taken = self.inner.source.borrow_mut().take();
        let Some(mut source) = taken else {
            if self.inner.source_busy.get() {
                trace!(stream = %self.inner.label, "re-entrant produce postponed");
                self.core_mut().state.reading = false;
                self.maybe_read_more();
            }
            return;
        };
        trace!(stream = %self.inner.label, size, "produce");
        self.inner.source_busy.set(true);
        let controller = self.controller();
        source.produce(&controller, size);
        self.inner.source_busy.set(false);
        self.restore_source(source);
    }

    fn restore_source(&self, source: Box<dyn Source<C>>) {
        let deferred = std::mem::take(&mut self.core_mut().destroy_deferred);
        if deferred {
            let error = self.core().error.clone();
            self.run_destroy_hook(source, error);
        } else {
            *self.inner.source.borrow_mut() = Some(source);
        }
    }

    fn release_source(&self, error: Option<StreamError>) {
        let taken = self.inner.source.borrow_mut().take();
        match taken {
            Some(source) => self.run_destroy_hook(source, error),
            None if self.inner.source_busy.get() => self.core_mut().destroy_deferred = true,
            None => self.on_source_destroyed(Ok(())),
        }
    }

    fn run_destroy_hook(&self, mut source: Box<dyn Source<C>>, error: Option<StreamError>) {
        let weak = Rc::downgrade(&self.inner);
        let done = Done::new(
            move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    Readable { inner }.on_source_destroyed(outcome);
                }
            },
            Done::dropped_destroy,
        );
        source.destroy(error.as_ref(), done);
    }

    fn on_source_destroyed(&self, outcome: Outcome) {
        if let Err(error) = outcome {
            self.core_mut().record_error(&error);
        }
        self.schedule(Self::emit_error_and_close);
    }

    fn emit_error_and_close(&self) {
        self.emit_error_once();
        let emit_close = {
            let mut core = self.core_mut();
            core.state.close_emitted = true;
            core.state.emit_close
        };
        if emit_close {
            self.emit_unit(UnitEvent::Close);
        }
        self.core_mut().events.clear();
    }

    fn emit_error_once(&self) {
        let payload = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            match core.error.clone() {
                Some(error) if !core.state.error_emitted => {
                    core.state.error_emitted = true;
                    Some((error, core.events.error.snapshot()))
                }
                _ => None,
            }
        };
        if let Some((error, listeners)) = payload {
            if listeners.is_empty() {
                warn!(stream = %self.inner.label, code = error.code(), %error, "readable error without listeners");
            }
            for listener in listeners {
                listener(&error);
            }
        }
    }

    /// 按自动销毁配置上报错误：开启时销毁，关闭时仅在下一拍派发 `error`。
    pub(crate) fn error_or_destroy(&self, error: StreamError) {
        let (destroyed, auto_destroy) = {
            let core = self.core();
            (core.state.destroyed, core.state.auto_destroy)
        };
        if destroyed {
            return;
        }
        if auto_destroy {
            self.destroy(Some(error));
        } else {
            self.core_mut().record_error(&error);
            self.schedule(Self::emit_error_once);
        }
    }

    fn emit_data(&self, chunk: &C) {
        let listeners = self.core_mut().events.data.snapshot();
        let mut pause = false;
        for listener in listeners {
            if listener(chunk) == Flow::Pause {
                pause = true;
            }
        }
        if pause {
            self.pause();
        }
    }

    fn emit_unit(&self, event: UnitEvent) {
        let listeners = self.core_mut().events.unit(event).snapshot();
        for listener in listeners {
            listener();
        }
    }

    fn emit_readable_tick(&self) {
        let due = self.core().state.readable_due();
        if due {
            self.emit_unit(UnitEvent::Readable);
        }
        self.core_mut().state.after_readable(due);
        self.flow();
    }

    fn flow(&self) {
        while self.core().state.flowing == Some(true) {
            if self.read(None).is_none() {
                break;
            }
        }
    }

    fn resume_tick(&self) {
        if !self.core().state.reading {
            self.read(Some(0));
        }
        self.core_mut().state.resume_scheduled = false;
        self.emit_unit(UnitEvent::Resume);
        self.flow();
        let state = self.core().state;
        if state.flowing == Some(true) && !state.reading {
            self.read(Some(0));
        }
    }

    fn maybe_read_more(&self) {
        let schedule = {
            let mut core = self.core_mut();
            if core.state.reading_more {
                false
            } else {
                core.state.reading_more = true;
                true
            }
        };
        if schedule {
            self.schedule(Self::read_more_tick);
        }
    }

    fn read_more_tick(&self) {
        loop {
            let (wants_more, before) = {
                let core = self.core();
                (core.state.wants_more(), core.state.length)
            };
            if !wants_more {
                break;
            }
            self.read(Some(0));
            if self.core().state.length == before {
                break;
            }
        }
        self.core_mut().state.reading_more = false;
    }

    fn end_readable(&self) {
        if self.core_mut().state.request_end() {
            self.schedule(Self::end_tick);
        }
    }

    fn end_tick(&self) {
        if !self.core_mut().state.take_end() {
            return;
        }
        debug!(stream = %self.inner.label, "readable end emitted");
        self.emit_unit(UnitEvent::End);
        let (auto_destroy, guard) = {
            let core = self.core();
            (core.state.auto_destroy, core.auto_destroy_guard.clone())
        };
        if auto_destroy && guard.is_none_or(|allowed| allowed()) {
            self.destroy(None);
        }
    }

    fn update_readable_listening(&self) {
        let resume = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            core.state.readable_listening = !core.events.readable.is_empty();
            if core.state.resume_scheduled && core.state.paused == Some(false) {
                core.state.flowing = Some(true);
                false
            } else if !core.events.data.is_empty() {
                true
            } else {
                if !core.state.readable_listening {
                    core.state.flowing = None;
                }
                false
            }
        };
        if resume {
            self.resume();
        }
    }
}

impl<C: Chunk> fmt::Debug for Readable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readable")
            .field("label", &self.inner.label)
            .field("state", &self.core().state)
            .finish()
    }
}

/// 生产者持有的推送控制器。
///
/// 控制器只持有引擎的弱引用：引擎被释放后，所有操作静默失效（`push` 返回 `false`）。
pub struct ReadableController<C: Chunk> {
    inner: Weak<Inner<C>>,
}

impl<C: Chunk> Clone for ReadableController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Chunk> ReadableController<C> {
    pub(crate) fn upgrade(&self) -> Option<Readable<C>> {
        self.inner.upgrade().map(|inner| Readable { inner })
    }

    /// 推送数据单元，语义同 [`Readable::push`]。
    pub fn push(&self, chunk: C) -> bool {
        self.upgrade().is_some_and(|readable| readable.push(chunk))
    }

    /// 放回队首，语义同 [`Readable::unshift`]。
    pub fn unshift(&self, chunk: C) -> bool {
        self.upgrade().is_some_and(|readable| readable.unshift(chunk))
    }

    /// 推送结束标记。
    pub fn end(&self) {
        if let Some(readable) = self.upgrade() {
            readable.end();
        }
    }

    /// 以错误销毁引擎。
    pub fn error(&self, error: StreamError) {
        self.destroy(Some(error));
    }

    pub fn destroy(&self, error: Option<StreamError>) {
        if let Some(readable) = self.upgrade() {
            readable.destroy(error);
        }
    }

    /// 引擎已被释放或已销毁。
    pub fn is_closed(&self) -> bool {
        self.upgrade().is_none_or(|readable| readable.is_destroyed())
    }

    pub fn readable_length(&self) -> usize {
        self.upgrade().map_or(0, |readable| readable.readable_length())
    }

    pub fn high_water_mark(&self) -> usize {
        self.upgrade().map_or(0, |readable| readable.high_water_mark())
    }

    /// 是否已收到结束标记。
    pub fn is_ended(&self) -> bool {
        self.upgrade().is_none_or(|readable| readable.is_ended())
    }
}

impl<C: Chunk> fmt::Debug for ReadableController<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableController")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}
