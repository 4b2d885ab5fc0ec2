//! # 可读端纯状态
//!
//! ## 角色定位（Why）
//! - 可读引擎的全部决策（是否直接投递、是否需要向源索取、何时通知 `readable`/`end`）都由若干布尔标志
//!   与缓冲长度共同决定；把这些标志集中为 [`ReadableState`]，并以转换函数修改，
//!   引擎只负责执行转换函数返回的副作用；
//! - 转换函数不触碰缓冲区、不调用任何回调，因此可以脱离引擎单独测试。
//!
//! ## 契约（What）
//! - `length` 是缓冲区长度的镜像，引擎在同一次借用中同时更新两者；
//! - `destroyed` 一旦置位永不复位；
//! - 每个转换函数的返回值描述“引擎接下来必须做什么”，引擎必须在释放借用后执行。

use crate::chunk::{ChunkMode, MAX_HIGH_WATER_MARK};
use crate::config::OverflowPolicy;
use crate::error::StreamError;

/// 可读引擎的可观察阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadablePhase {
    /// 没有缓冲数据，也没有未完成的索取。
    Idle,
    /// 已向源索取，等待推送。
    Reading,
    /// 有缓冲数据，尚未选择消费模式。
    HasData,
    /// 流动模式，数据由引擎主动投递。
    Draining,
    /// 暂停模式且有缓冲数据。
    Paused,
    /// 已收到结束标记且缓冲已空，`end` 尚未派发。
    Ended,
    /// `end` 已派发。
    EndEmitted,
    /// 已销毁。
    Destroyed,
}

/// 推送一个数据单元后的副作用。
#[derive(Debug)]
pub enum PushEffect {
    /// 绕过缓冲，直接投递给 `data` 监听器。
    Deliver,
    /// 进入缓冲；`schedule_readable` 为真时需在下一拍派发 `readable`。
    Buffer { schedule_readable: bool },
    /// 空单元，不入缓冲。
    Skip,
    /// 已销毁或已出错，静默丢弃。
    Drop,
    /// 违反协议，需要经错误通道上报。
    Reject(StreamError),
}

/// 收到结束标记后的副作用。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EofEffect {
    /// 重复的结束标记。
    Ignore,
    /// 下一拍派发 `readable`（推送发生在源的同步调用栈内）。
    ScheduleReadable,
    /// 立即执行一次 `readable` 派发。
    EmitReadableNow,
    /// 无需派发（`readable` 通知已在途）。
    None,
}

/// `read()` 开始阶段的判定。
#[derive(Debug)]
pub enum ReadStart {
    /// `read(0)` 且应立即结束。
    EndNow,
    /// `read(0)` 且应通知 `readable`；`schedule` 表示需要登记下一拍任务。
    NotifyReadable { schedule: bool },
    /// 已结束且无可取数据；`end_now` 表示需要触发 `end` 流程。
    Exhausted { end_now: bool },
    /// 继续取数；`produce` 为真时需调用源的 `produce(high_water_mark)`。
    Proceed { want: usize, produce: bool },
    /// 请求尺寸超限。
    Invalid(StreamError),
}

/// `read()` 结束阶段的判定。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadFinish {
    /// 需要触发 `end` 流程。
    pub end_now: bool,
    /// 需要派发 `data`。
    pub emit_data: bool,
}

/// 可读端状态。
///
/// # 教案式说明
/// - **意图 (Why)**：推/拉两种消费协议共用同一组标志，唯一区别是 `flowing` 的取值；
///   用三态 `Option<bool>` 表达“尚未选择 / 流动 / 暂停”，避免额外的模式枚举；
/// - **契约 (What)**：
///   - `reading` 为真表示有一次 `produce` 尚未被推送应答，保证同一时刻至多一次未完成的索取；
///   - `sync` 仅在 `produce` 的同步调用期间为真，此时推送一律进入缓冲，不直接投递；
///   - `need_readable` / `emitted_readable` 共同保证 `readable` 通知不重复、不遗漏；
/// - **设计权衡 (Trade-offs)**：字段全部公开只读（通过 `Copy` 快照），便于测试断言，
///   修改只能经由 `pub(crate)` 转换函数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadableState {
    pub mode: ChunkMode,
    pub length: usize,
    pub high_water_mark: usize,
    pub overflow: OverflowPolicy,
    pub flowing: Option<bool>,
    pub paused: Option<bool>,
    pub reading: bool,
    pub sync: bool,
    pub ended: bool,
    pub end_emitted: bool,
    pub need_readable: bool,
    pub emitted_readable: bool,
    pub readable_listening: bool,
    pub resume_scheduled: bool,
    pub reading_more: bool,
    pub data_emitted: bool,
    pub destroyed: bool,
    pub errored: bool,
    pub error_emitted: bool,
    pub close_emitted: bool,
    pub auto_destroy: bool,
    pub emit_close: bool,
}

impl ReadableState {
    pub(crate) fn new(
        mode: ChunkMode,
        high_water_mark: usize,
        overflow: OverflowPolicy,
        auto_destroy: bool,
        emit_close: bool,
    ) -> Self {
        Self {
            mode,
            length: 0,
            high_water_mark,
            overflow,
            flowing: None,
            paused: None,
            reading: false,
            sync: true,
            ended: false,
            end_emitted: false,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            reading_more: false,
            data_emitted: false,
            destroyed: false,
            errored: false,
            error_emitted: false,
            close_emitted: false,
            auto_destroy,
            emit_close,
        }
    }

    /// 当前阶段。
    pub fn phase(&self) -> ReadablePhase {
        if self.destroyed {
            ReadablePhase::Destroyed
        } else if self.end_emitted {
            ReadablePhase::EndEmitted
        } else if self.ended && self.length == 0 {
            ReadablePhase::Ended
        } else if self.length > 0 {
            match self.flowing {
                Some(true) => ReadablePhase::Draining,
                Some(false) => ReadablePhase::Paused,
                None => ReadablePhase::HasData,
            }
        } else if self.reading {
            ReadablePhase::Reading
        } else {
            ReadablePhase::Idle
        }
    }

    /// 推送后是否还欢迎更多数据（即 `push` 的返回值）。
    pub fn can_push_more(&self) -> bool {
        !self.ended && (self.length < self.high_water_mark || self.length == 0)
    }

    /// 是否处于暂停：显式暂停，或未表态但流动标志为暂停。
    pub fn is_paused(&self) -> bool {
        self.paused == Some(true) || (self.paused.is_none() && self.flowing == Some(false))
    }

    /// 推送一个尺寸为 `size` 的数据单元。
    ///
    /// - `front` 为真表示 `unshift`；
    /// - `has_data_listeners` 表示当前是否存在 `data` 监听器；
    /// - 返回 [`PushEffect::Buffer`] 时，`length` 已经加上 `size`，引擎必须在同一借用中入队。
    pub(crate) fn on_push(&mut self, size: usize, front: bool, has_data_listeners: bool) -> PushEffect {
        if size == 0 && self.mode == ChunkMode::Bytes {
            if !front {
                self.reading = false;
            }
            return PushEffect::Skip;
        }

        if front {
            if self.end_emitted {
                return PushEffect::Reject(StreamError::UnshiftAfterEnd);
            }
            if self.destroyed || self.errored {
                return PushEffect::Drop;
            }
        } else {
            if self.ended {
                return PushEffect::Reject(StreamError::PushAfterEnd);
            }
            if self.destroyed || self.errored {
                return PushEffect::Drop;
            }
            self.reading = false;
            if self.overflow == OverflowPolicy::Reject
                && self.length > 0
                && self.length >= self.high_water_mark
            {
                return PushEffect::Reject(StreamError::HighWaterMarkExceeded {
                    length: self.length,
                    high_water_mark: self.high_water_mark,
                });
            }
        }

        if self.flowing == Some(true) && self.length == 0 && !self.sync && has_data_listeners {
            self.data_emitted = true;
            return PushEffect::Deliver;
        }

        self.length += size;
        let schedule_readable = self.need_readable && self.request_readable();
        PushEffect::Buffer { schedule_readable }
    }

    /// 收到结束标记。
    pub(crate) fn on_eof(&mut self) -> EofEffect {
        self.reading = false;
        if self.ended {
            return EofEffect::Ignore;
        }
        self.ended = true;
        if self.sync {
            if self.request_readable() {
                EofEffect::ScheduleReadable
            } else {
                EofEffect::None
            }
        } else {
            self.need_readable = false;
            self.emitted_readable = true;
            EofEffect::EmitReadableNow
        }
    }

    /// 请求一次 `readable` 通知；返回是否需要登记下一拍任务。
    pub(crate) fn request_readable(&mut self) -> bool {
        self.need_readable = false;
        if self.emitted_readable {
            return false;
        }
        self.emitted_readable = true;
        true
    }

    /// `readable` 派发拍：返回是否应当真正派发事件。
    pub(crate) fn readable_due(&self) -> bool {
        !self.destroyed && !self.errored && (self.length > 0 || self.ended)
    }

    /// `readable` 派发拍之后的收尾。
    pub(crate) fn after_readable(&mut self, emitted: bool) {
        if emitted {
            self.emitted_readable = false;
        }
        self.need_readable =
            self.flowing != Some(true) && !self.ended && self.length <= self.high_water_mark;
    }

    /// 还需索取多少：`requested` 为 `None` 表示“按模式默认”。
    pub fn how_much_to_read(&self, requested: Option<usize>) -> usize {
        if requested == Some(0) || (self.length == 0 && self.ended) {
            return 0;
        }
        if self.mode == ChunkMode::Object {
            return 1;
        }
        match requested {
            None => self.length,
            Some(n) if n <= self.length => n,
            Some(_) if self.ended => self.length,
            Some(_) => 0,
        }
    }

    /// `read()` 开始阶段。
    ///
    /// `first_size` 为缓冲队首单元尺寸，流动模式下 `read()` 每次只取一个单元。
    pub(crate) fn begin_read(&mut self, requested: Option<usize>, first_size: usize) -> ReadStart {
        if let Some(n) = requested {
            if n > self.high_water_mark {
                if n > MAX_HIGH_WATER_MARK {
                    return ReadStart::Invalid(StreamError::HighWaterMarkOutOfRange {
                        requested: n,
                    });
                }
                self.high_water_mark = n.next_power_of_two().min(MAX_HIGH_WATER_MARK);
            }
        }
        if requested != Some(0) {
            self.emitted_readable = false;
        }

        if requested == Some(0) && self.need_readable {
            let full = if self.high_water_mark != 0 {
                self.length >= self.high_water_mark
            } else {
                self.length > 0
            };
            if full || self.ended {
                if self.length == 0 && self.ended {
                    return ReadStart::EndNow;
                }
                return ReadStart::NotifyReadable {
                    schedule: self.request_readable(),
                };
            }
        }

        let want = self.resolve_want(requested, first_size);
        if want == 0 && self.ended {
            return ReadStart::Exhausted {
                end_now: self.length == 0,
            };
        }

        let mut produce = self.need_readable;
        if self.length == 0 || self.length.saturating_sub(want) < self.high_water_mark {
            produce = true;
        }
        if self.ended || self.reading || self.destroyed || self.errored {
            produce = false;
        } else if produce {
            self.reading = true;
            self.sync = true;
            if self.length == 0 {
                self.need_readable = true;
            }
        }
        ReadStart::Proceed { want, produce }
    }

    /// `produce` 同步返回后重新计算需要的数量。
    pub(crate) fn after_produce(&mut self, requested: Option<usize>, want: usize, first_size: usize) -> usize {
        self.sync = false;
        if self.reading {
            want
        } else {
            self.resolve_want(requested, first_size)
        }
    }

    /// `read()` 结束阶段；`taken` 为实际取出的尺寸。
    pub(crate) fn finish_read(&mut self, requested: Option<usize>, taken: Option<usize>) -> ReadFinish {
        let n = match taken {
            Some(size) => {
                self.length -= size;
                size
            }
            None => {
                self.need_readable = self.length <= self.high_water_mark;
                0
            }
        };

        let mut finish = ReadFinish::default();
        if self.length == 0 {
            if !self.ended {
                self.need_readable = true;
            }
            if requested != Some(n) && self.ended {
                finish.end_now = true;
            }
        }
        if taken.is_some() && !self.error_emitted && !self.close_emitted {
            self.data_emitted = true;
            finish.emit_data = true;
        }
        finish
    }

    /// 请求结束流程；返回是否需要登记 `end` 派发拍。
    pub(crate) fn request_end(&mut self) -> bool {
        if self.end_emitted {
            return false;
        }
        self.ended = true;
        true
    }

    /// `end` 派发拍：返回是否应当派发 `end`。
    pub(crate) fn take_end(&mut self) -> bool {
        if !self.errored
            && !self.destroyed
            && !self.close_emitted
            && !self.end_emitted
            && self.length == 0
        {
            self.end_emitted = true;
            return true;
        }
        false
    }

    /// `resume()`：返回是否需要登记恢复拍。
    pub(crate) fn resume(&mut self) -> bool {
        let mut schedule = false;
        if self.flowing != Some(true) {
            self.flowing = Some(!self.readable_listening);
            if !self.resume_scheduled {
                self.resume_scheduled = true;
                schedule = true;
            }
        }
        self.paused = Some(false);
        schedule
    }

    /// `pause()`：返回是否需要派发 `pause` 事件。
    pub(crate) fn pause(&mut self) -> bool {
        let emit = self.flowing != Some(false);
        if emit {
            self.flowing = Some(false);
        }
        self.paused = Some(true);
        emit
    }

    /// 读取更多的循环条件。
    pub(crate) fn wants_more(&self) -> bool {
        !self.reading
            && !self.ended
            && !self.destroyed
            && (self.length < self.high_water_mark || (self.flowing == Some(true) && self.length == 0))
    }

    /// 首次注册 `readable` 监听器；返回后续动作。
    pub(crate) fn on_readable_listener(&mut self) -> ReadableListenerEffect {
        if self.end_emitted || self.readable_listening {
            return ReadableListenerEffect::None;
        }
        self.readable_listening = true;
        self.need_readable = true;
        self.flowing = Some(false);
        self.emitted_readable = false;
        if self.length > 0 {
            if self.request_readable() {
                ReadableListenerEffect::ScheduleReadable
            } else {
                ReadableListenerEffect::None
            }
        } else if !self.reading {
            ReadableListenerEffect::ScheduleRead
        } else {
            ReadableListenerEffect::None
        }
    }

    fn resolve_want(&self, requested: Option<usize>, first_size: usize) -> usize {
        if requested.is_none()
            && self.mode == ChunkMode::Bytes
            && self.flowing == Some(true)
            && self.length > 0
        {
            return first_size;
        }
        self.how_much_to_read(requested)
    }
}

/// 注册 `readable` 监听器后的动作。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadableListenerEffect {
    None,
    ScheduleReadable,
    ScheduleRead,
}
