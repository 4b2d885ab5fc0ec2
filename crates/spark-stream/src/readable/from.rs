//! 从同步迭代器或异步 `Stream` 构造可读引擎。

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;

use futures::{Stream, StreamExt};
use tracing::trace;

use super::engine::{Readable, ReadableController, Source};
use crate::chunk::Chunk;
use crate::completion::Done;
use crate::config::ReadableOptions;
use crate::error::StreamError;
use crate::tick::SharedScheduler;

/// 可被引擎消费的本地异步数据流。
pub type LocalStream<C> = Pin<Box<dyn Stream<Item = Result<C, StreamError>> + 'static>>;

struct IterSource<I> {
    iter: I,
}

impl<C, I> Source<C> for IterSource<I>
where
    C: Chunk,
    I: Iterator<Item = C>,
{
    fn produce(&mut self, controller: &ReadableController<C>, _size: usize) {
        loop {
            match self.iter.next() {
                Some(chunk) => {
                    if !controller.push(chunk) {
                        break;
                    }
                }
                None => {
                    controller.end();
                    break;
                }
            }
        }
    }
}

/// 异步流的共享泵状态。
///
/// - `demand`：引擎最近一次 `produce` 之后是否仍欢迎数据；
/// - `pumping`：是否已有一个本地任务在拉取上游；
/// - `closed`：引擎已销毁，上游应被丢弃。
struct Pump<C: Chunk> {
    upstream: RefCell<Option<LocalStream<C>>>,
    demand: Cell<bool>,
    pumping: Cell<bool>,
    closed: Cell<bool>,
    scheduler: SharedScheduler,
}

struct StreamSource<C: Chunk> {
    pump: Rc<Pump<C>>,
}

impl<C: Chunk> Source<C> for StreamSource<C> {
    fn produce(&mut self, controller: &ReadableController<C>, _size: usize) {
        self.pump.demand.set(true);
        if self.pump.pumping.replace(true) {
            return;
        }
        let pump = self.pump.clone();
        let controller = controller.clone();
        self.pump.scheduler.spawn_local(Box::pin(async move {
            let Some(mut upstream) = pump.upstream.borrow_mut().take() else {
                pump.pumping.set(false);
                return;
            };
            while pump.demand.get() && !pump.closed.get() {
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        pump.demand.set(false);
                        if controller.push(chunk) {
                            pump.demand.set(true);
                        }
                    }
                    Some(Err(error)) => {
                        controller.error(error);
                        pump.closed.set(true);
                    }
                    None => {
                        controller.end();
                        pump.closed.set(true);
                    }
                }
            }
            if !pump.closed.get() {
                *pump.upstream.borrow_mut() = Some(upstream);
            }
            pump.pumping.set(false);
            trace!("upstream pump parked");
        }));
    }

    fn destroy(&mut self, _error: Option<&StreamError>, done: Done) {
        self.pump.closed.set(true);
        self.pump.upstream.borrow_mut().take();
        done.succeed();
    }
}

impl<C: Chunk> Readable<C> {
    /// 由同步迭代器构造：每次索取时持续推送直到背压或耗尽，耗尽后推送结束标记。
    pub fn from_iter<I>(iter: I, options: ReadableOptions, scheduler: SharedScheduler) -> Self
    where
        I: IntoIterator<Item = C>,
        I::IntoIter: 'static,
    {
        Self::new(
            IterSource {
                iter: iter.into_iter(),
            },
            options,
            scheduler,
        )
    }

    /// 由本地异步流构造。
    ///
    /// 上游由调度器托管的本地任务拉取；引擎背压时任务停止拉取并归还上游，
    /// 下一次索取时重新启动。上游产出 `Err` 时引擎以该错误销毁。
    pub fn from_stream(upstream: LocalStream<C>, options: ReadableOptions, scheduler: SharedScheduler) -> Self {
        let pump = Rc::new(Pump {
            upstream: RefCell::new(Some(upstream)),
            demand: Cell::new(false),
            pumping: Cell::new(false),
            closed: Cell::new(false),
            scheduler: scheduler.clone(),
        });
        Self::new(StreamSource { pump }, options, scheduler)
    }
}
