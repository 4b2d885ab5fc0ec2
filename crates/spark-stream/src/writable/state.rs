//! 可写端的纯数据状态与转换函数。

use crate::chunk::ChunkMode;
use crate::error::StreamError;

/// 由状态快照推导出的可写阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WritablePhase {
    /// 无写入在途。
    Idle,
    /// 有一次写入等待汇确认。
    Writing,
    /// 被 `cork` 暂存。
    Corked,
    /// 已调用 `end`，等待缓冲排空与 `finish`。
    Ending,
    Finished,
    Destroyed,
}

/// `write` 的准入判定。
#[derive(Debug)]
pub(crate) enum Admission {
    /// 拒绝写入；完成句柄在下一拍以该错误结算。
    Rejected(StreamError),
    /// 立即派发给汇。
    Dispatch { ready: bool },
    /// 进入写缓冲。
    Buffer { ready: bool },
}

/// 可写端状态。
///
/// # 教案式说明
/// - **意图 (Why)**：写入、cork、结束、销毁四条路径共用一组标志，集中在纯数据结构中便于
///   单元测试逐条验证；
/// - **契约 (What)**：
///   - 仅当 `!writing && corked == 0 && !errored` 时写入才会直接派发，其余情况一律进入缓冲；
///   - `length` 计入在途与缓冲中的全部计量单位，`length >= high_water_mark` 时 `write` 报告背压；
///   - `pending_callbacks` 统计尚未结算的写入与 `finish` 句柄，归零前不会派发 `finish`；
///   - `finished` 蕴含缓冲为空；
/// - **设计权衡 (Trade-offs)**：`sync` 初始为真，含义是“当前处于汇的同步调用栈内”，
///   此时的完成通知需要推迟到下一拍。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritableState {
    pub mode: ChunkMode,
    pub high_water_mark: usize,
    pub length: usize,
    pub corked: u32,
    pub writing: bool,
    pub sync: bool,
    pub ending: bool,
    pub ended: bool,
    pub finished: bool,
    pub final_called: bool,
    pub prefinished: bool,
    pub need_drain: bool,
    pub buffer_processing: bool,
    pub buffered: usize,
    pub pending_callbacks: usize,
    pub destroyed: bool,
    pub errored: bool,
    pub error_emitted: bool,
    pub close_emitted: bool,
    pub auto_destroy: bool,
    pub emit_close: bool,
}

impl WritableState {
    pub(crate) fn new(mode: ChunkMode, high_water_mark: usize, auto_destroy: bool, emit_close: bool) -> Self {
        Self {
            mode,
            high_water_mark,
            length: 0,
            corked: 0,
            writing: false,
            sync: true,
            ending: false,
            ended: false,
            finished: false,
            final_called: false,
            prefinished: false,
            need_drain: false,
            buffer_processing: false,
            buffered: 0,
            pending_callbacks: 0,
            destroyed: false,
            errored: false,
            error_emitted: false,
            close_emitted: false,
            auto_destroy,
            emit_close,
        }
    }

    pub fn phase(&self) -> WritablePhase {
        if self.destroyed {
            WritablePhase::Destroyed
        } else if self.finished {
            WritablePhase::Finished
        } else if self.ending {
            WritablePhase::Ending
        } else if self.corked > 0 {
            WritablePhase::Corked
        } else if self.writing {
            WritablePhase::Writing
        } else {
            WritablePhase::Idle
        }
    }

    /// 仍可接受写入：未销毁、未出错、未开始结束。
    pub fn is_writable(&self) -> bool {
        !self.destroyed && !self.errored && !self.ending
    }

    /// 判定一次 `write` 的去向，并记账长度与待结算计数。
    pub(crate) fn admit(&mut self, size: usize) -> Admission {
        if self.ending {
            return Admission::Rejected(StreamError::WriteAfterEnd);
        }
        if self.destroyed {
            return Admission::Rejected(StreamError::Destroyed { operation: "write" });
        }
        self.pending_callbacks += 1;
        self.length += size;
        let ready = self.length < self.high_water_mark;
        if !ready {
            self.need_drain = true;
        }
        if self.writing || self.corked > 0 || self.errored {
            self.buffered += 1;
            Admission::Buffer { ready }
        } else {
            self.writing = true;
            Admission::Dispatch { ready }
        }
    }

    /// 在途写入被确认，扣减其长度。
    pub(crate) fn on_acknowledged(&mut self, size: usize) {
        self.writing = false;
        self.length = self.length.saturating_sub(size);
    }

    /// 缓冲可以开始派发。
    pub(crate) fn can_clear_buffer(&self) -> bool {
        self.corked == 0 && !self.buffer_processing && !self.destroyed && self.buffered > 0
    }

    /// 满足派发 `drain` 的条件时清除 `need_drain` 并返回 `true`。
    pub(crate) fn take_drain(&mut self) -> bool {
        let due = !self.ending && !self.destroyed && self.length == 0 && self.need_drain;
        if due {
            self.need_drain = false;
        }
        due
    }

    /// 是否满足进入结束流程的全部前提。
    pub(crate) fn need_finish(&self) -> bool {
        self.ending
            && !self.destroyed
            && self.length == 0
            && !self.errored
            && self.buffered == 0
            && !self.finished
            && !self.writing
            && !self.error_emitted
            && !self.close_emitted
    }

    /// `end` 被调用：若此前未结束且未出错则进入结束流程并返回 `true`，否则返回应当报告的错误。
    pub(crate) fn begin_end(&mut self) -> Result<bool, StreamError> {
        if !self.errored && !self.ending {
            self.ending = true;
            Ok(true)
        } else if self.finished {
            Err(StreamError::AlreadyFinished { operation: "end" })
        } else if self.destroyed {
            Err(StreamError::Destroyed { operation: "end" })
        } else {
            Ok(false)
        }
    }

    /// 解除一层 cork；返回是否应尝试派发缓冲。
    pub(crate) fn uncork(&mut self) -> bool {
        if self.corked == 0 {
            return false;
        }
        self.corked -= 1;
        self.corked == 0 && !self.writing
    }
}
