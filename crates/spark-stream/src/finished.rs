//! # finished 模块说明
//!
//! ## 角色定位（Why）
//! - 调用方常常只关心“这条流是否正常走完”：可读端派发了 `end`、可写端派发了 `finish`，
//!   或者中途出错、提前关闭；[`finished`] 把这些事件折叠为一个 [`Completion`]；
//! - [`Pipeline`] 在此基础上把“可读端 → 若干转换端 → 可写端”串成一条链，任一环节失败即拆除整条链。
//!
//! ## 契约（What）
//! - 正常结束结算为 `Ok(())`；出错结算为首个错误；未结束即关闭结算为 [`StreamError::PrematureClose`]；
//! - 对已经结束或已经关闭的流调用时立即结算。

use std::rc::Rc;

use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::completion::Completion;
use crate::config::PipeOptions;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::pipe::pipe;
use crate::readable::Readable;
use crate::transform::Transform;
use crate::writable::Writable;

/// 管道整体的完成 Future。
pub type PipelineCompletion = Completion;

/// 可以观察“是否正常结束”的流。
pub trait Finishable {
    /// 注册观察者并返回完成 Future。
    fn watch_finished(&self) -> Completion;
}

/// 等待流结束。
pub fn finished<S>(stream: &S) -> Completion
where
    S: Finishable + ?Sized,
{
    stream.watch_finished()
}

impl<C: Chunk> Finishable for Readable<C> {
    fn watch_finished(&self) -> Completion {
        if self.is_end_emitted() {
            return Completion::settled(Ok(()));
        }
        if self.is_closed() || self.state().error_emitted {
            let error = self.error().unwrap_or(StreamError::PrematureClose);
            return Completion::settled(Err(error));
        }

        let completion = Completion::pending();
        {
            let completion = completion.clone();
            self.on_end(move || {
                completion.resolve(Ok(()));
            });
        }
        {
            let completion = completion.clone();
            self.on_error(move |error| {
                completion.resolve(Err(error.clone()));
            });
        }
        {
            let completion = completion.clone();
            let controller = self.controller();
            self.on_close(move || {
                let outcome = match controller.upgrade() {
                    Some(readable) if readable.is_end_emitted() => Ok(()),
                    Some(readable) => Err(readable.error().unwrap_or(StreamError::PrematureClose)),
                    None => Err(StreamError::PrematureClose),
                };
                completion.resolve(outcome);
            });
        }
        completion
    }
}

impl<C: Chunk> Finishable for Writable<C> {
    fn watch_finished(&self) -> Completion {
        if self.is_finished() {
            return Completion::settled(Ok(()));
        }
        if self.is_closed() || self.state().error_emitted {
            let error = self.error().unwrap_or(StreamError::PrematureClose);
            return Completion::settled(Err(error));
        }

        let completion = Completion::pending();
        {
            let completion = completion.clone();
            self.on_finish(move || {
                completion.resolve(Ok(()));
            });
        }
        {
            let completion = completion.clone();
            self.on_error(move |error| {
                completion.resolve(Err(error.clone()));
            });
        }
        {
            let completion = completion.clone();
            let writable = self.downgrade();
            self.on_close(move || {
                let outcome = match writable.upgrade() {
                    Some(writable) if writable.is_finished() => Ok(()),
                    Some(writable) => Err(writable.error().unwrap_or(StreamError::PrematureClose)),
                    None => Err(StreamError::PrematureClose),
                };
                completion.resolve(outcome);
            });
        }
        completion
    }
}

impl<R: Chunk, W: Chunk> Finishable for Duplex<R, W> {
    /// 两侧都正常结束才结算为成功；任一侧失败立即以该错误结算。
    fn watch_finished(&self) -> Completion {
        let parts = [
            self.readable().watch_finished(),
            self.writable().watch_finished(),
        ];
        let combined = Completion::pending();
        for part in &parts {
            let combined = combined.clone();
            let siblings = parts.clone();
            part.on_settled(move |outcome| match outcome {
                Err(error) => {
                    combined.resolve(Err(error.clone()));
                }
                Ok(()) => {
                    if siblings
                        .iter()
                        .all(|sibling| matches!(sibling.outcome(), Some(Ok(()))))
                    {
                        combined.resolve(Ok(()));
                    }
                }
            });
        }
        combined
    }
}

impl<I: Chunk, O: Chunk> Finishable for Transform<I, O> {
    fn watch_finished(&self) -> Completion {
        self.duplex().watch_finished()
    }
}

type Destroyer = Rc<dyn Fn(StreamError)>;

struct Stage {
    label: String,
    finished: Completion,
    destroy: Destroyer,
}

/// 类型化的多段管道构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：逐段调用 [`pipe`] 只联动相邻两段；多段链路需要“任一段失败，全部拆除”的整体语义；
/// - **契约 (What)**：
///   - `source(r).through(&t1).through(&t2).to(&w)` 依次建立管道，类型参数保证相邻两段的数据单元一致；
///   - 返回的 [`PipelineCompletion`] 在最后的可写端 `finish` 时结算为成功，
///     任一段出错或提前关闭时以首个错误结算，并以该错误销毁全部各段；
/// - **设计权衡 (Trade-offs)**：各段的销毁闭包持有强引用，直到各段派发 `close` 清空监听器后释放。
pub struct Pipeline<C: Chunk + Clone> {
    tail: Readable<C>,
    stages: Vec<Stage>,
    options: PipeOptions,
}

impl<C: Chunk + Clone> Pipeline<C> {
    /// 以可读端作为链路起点。
    pub fn source(readable: &Readable<C>) -> Self {
        let destroy: Destroyer = {
            let readable = readable.clone();
            Rc::new(move |error| readable.destroy(Some(error)))
        };
        Self {
            tail: readable.clone(),
            stages: vec![Stage {
                label: readable.label().to_owned(),
                finished: finished(readable),
                destroy,
            }],
            options: PipeOptions::default(),
        }
    }

    /// 设置各段管道使用的选项。
    pub fn with_options(mut self, options: PipeOptions) -> Self {
        self.options = options;
        self
    }

    /// 追加一个转换段。
    pub fn through<O>(self, transform: &Transform<C, O>) -> Pipeline<O>
    where
        O: Chunk + Clone,
    {
        pipe(&self.tail, transform.writable(), self.options);
        let destroy: Destroyer = {
            let transform = transform.clone();
            Rc::new(move |error| transform.destroy(Some(error)))
        };
        let mut stages = self.stages;
        stages.push(Stage {
            label: transform.readable().label().to_owned(),
            finished: finished(transform),
            destroy,
        });
        Pipeline {
            tail: transform.readable().clone(),
            stages,
            options: self.options,
        }
    }

    /// 以可写端结束链路并返回整体完成 Future。
    pub fn to(self, dest: &Writable<C>) -> PipelineCompletion {
        pipe(&self.tail, dest, self.options);
        let destroy: Destroyer = {
            let dest = dest.clone();
            Rc::new(move |error| dest.destroy(Some(error)))
        };
        let mut stages = self.stages;
        stages.push(Stage {
            label: dest.label().to_owned(),
            finished: finished(dest),
            destroy,
        });
        debug!(stages = stages.len(), "pipeline assembled");

        let result = Completion::pending();
        let destroyers: Rc<Vec<Destroyer>> =
            Rc::new(stages.iter().map(|stage| stage.destroy.clone()).collect());
        let last = stages.len() - 1;
        for (index, stage) in stages.into_iter().enumerate() {
            let result = result.clone();
            let destroyers = destroyers.clone();
            let label = stage.label;
            stage.finished.on_settled(move |outcome| match outcome {
                Err(error) => {
                    if result.resolve(Err(error.clone())) {
                        warn!(stage = %label, code = error.code(), %error, "pipeline stage failed, tearing down");
                        for destroy in destroyers.iter() {
                            destroy(error.clone());
                        }
                    }
                }
                Ok(()) => {
                    if index == last {
                        result.resolve(Ok(()));
                    }
                }
            });
        }
        result
    }
}
