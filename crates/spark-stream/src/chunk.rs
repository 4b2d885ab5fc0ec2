//! # chunk 模块说明
//!
//! ## 角色定位（Why）
//! - 流控引擎只关心“数据单元有多大”以及“如何按需要量取出”，不关心单元里装的是什么；
//! - 通过 [`Chunk`] trait 把“字节模式 / 对象模式”从运行期标志提升为编译期类型参数，
//!   引擎代码无需再在热路径上分支判断模式。
//!
//! ## 契约（What）
//! - 字节模式：[`Bytes`]，尺寸为字节长度，可拆分、可拼接；
//! - 对象模式：[`Object<T>`]，尺寸恒为 1，不拆分、不拼接；
//! - [`ChunkMode::default_high_water_mark`] 给出两种模式的默认高水位（64 KiB / 16 个对象）。

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};

/// 高水位允许的最大值（1 GiB），`read(n)` 自动抬升水位时不得越过该上限。
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// 数据单元的计量模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkMode {
    /// 以字节计量，单元可被拆分与合并。
    Bytes,
    /// 以对象个数计量，每个单元尺寸为 1。
    Object,
}

impl ChunkMode {
    /// 返回该模式下的默认高水位。
    pub const fn default_high_water_mark(self) -> usize {
        match self {
            ChunkMode::Bytes => 64 * 1024,
            ChunkMode::Object => 16,
        }
    }
}

/// 引擎可搬运的数据单元。
///
/// # 教案式说明
/// - **意图 (Why)**：引擎在记账（`length`）和出队（`dequeue(n)`）两处需要知道单元尺寸与切分方式，
///   其余逻辑完全与内容无关；把这两点收敛为 trait，读写引擎即可对任意载荷复用。
/// - **契约 (What)**：
///   - `size()` 必须稳定：同一单元在入队与出队时返回相同的值；
///   - `take(queue, want)` 从队首取出不超过 `want` 个计量单位的数据，并保持整体顺序；
///     调用方保证 `want > 0` 且不超过队列总尺寸。
/// - **执行逻辑 (How)**：默认实现直接弹出队首单元，适用于对象模式；字节模式覆盖实现以支持拆分与拼接。
/// - **设计权衡 (Trade-offs)**：拆分/拼接语义放在 trait 上而非缓冲区内，代价是实现者需理解队列结构，
///   收益是缓冲区保持单一实现。
pub trait Chunk: Sized + 'static {
    /// 该类型对应的计量模式。
    const MODE: ChunkMode;

    /// 单元尺寸（字节数或 1）。
    fn size(&self) -> usize;

    /// 从队首取出至多 `want` 个计量单位。
    fn take(queue: &mut VecDeque<Self>, want: usize) -> Option<Self> {
        let _ = want;
        queue.pop_front()
    }
}

impl Chunk for Bytes {
    const MODE: ChunkMode = ChunkMode::Bytes;

    fn size(&self) -> usize {
        self.len()
    }

    /// 字节模式出队：单块满足时零拷贝切分，跨块时只做一次拷贝拼接。
    fn take(queue: &mut VecDeque<Self>, want: usize) -> Option<Self> {
        let first_len = queue.front()?.len();
        if want == first_len {
            return queue.pop_front();
        }
        if want < first_len {
            let first = queue.front_mut()?;
            return Some(first.split_to(want));
        }

        let mut joined = BytesMut::with_capacity(want);
        let mut remaining = want;
        while remaining > 0 {
            let Some(front) = queue.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                joined.extend_from_slice(&front[..]);
                queue.pop_front();
            } else {
                joined.extend_from_slice(&front.split_to(remaining));
                remaining = 0;
            }
        }
        Some(joined.freeze())
    }
}

/// 对象模式的数据单元包装。
///
/// 任意 `'static` 类型都可通过 `Object(value)` 进入引擎，尺寸按 1 计。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Object<T>(pub T);

impl<T> Object<T> {
    /// 取出内部值。
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Object<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Object<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for Object<T> {
    fn from(value: T) -> Self {
        Object(value)
    }
}

impl<T: 'static> Chunk for Object<T> {
    const MODE: ChunkMode = ChunkMode::Object;

    fn size(&self) -> usize {
        1
    }
}
