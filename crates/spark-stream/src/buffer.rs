use std::collections::VecDeque;

use crate::chunk::Chunk;

/// 已生产但尚未被消费的数据单元队列。
///
/// # 教案式说明
/// - **意图 (Why)**：可读引擎需要在“生产者推入”与“消费者取出”之间暂存数据，并随时回答
///   “缓冲了多少”“是否达到高水位”两个问题，以此驱动背压。
/// - **契约 (What)**：
///   - 任意时刻 `length == Σ size(已入队单元)`；
///   - 出队保持入队顺序，字节模式的拆分/拼接不改变字节序；
///   - 缓冲区只由所属引擎修改，不做任何内部同步。
/// - **执行逻辑 (How)**：底层为 [`VecDeque`]，`length` 在每次入队/出队时同步增减；
///   出队的切分策略委托给 [`Chunk::take`]。
/// - **设计权衡 (Trade-offs)**：高水位只作为判定阈值，缓冲区本身从不拒绝入队，
///   是否拒绝由引擎的溢出策略决定。
#[derive(Debug)]
pub struct ChunkBuffer<C: Chunk> {
    queue: VecDeque<C>,
    length: usize,
    high_water_mark: usize,
}

impl<C: Chunk> ChunkBuffer<C> {
    /// 以给定高水位创建空缓冲。
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            length: 0,
            high_water_mark,
        }
    }

    /// 追加到队尾，返回追加后的总尺寸。
    pub fn enqueue(&mut self, chunk: C) -> usize {
        self.length += chunk.size();
        self.queue.push_back(chunk);
        self.length
    }

    /// 放回队首，返回放回后的总尺寸。
    pub fn enqueue_front(&mut self, chunk: C) -> usize {
        self.length += chunk.size();
        self.queue.push_front(chunk);
        self.length
    }

    /// 取出至多 `max` 个计量单位；缓冲为空或 `max == 0` 时返回 `None`。
    pub fn dequeue(&mut self, max: usize) -> Option<C> {
        let want = max.min(self.length);
        if want == 0 {
            return None;
        }
        let chunk = C::take(&mut self.queue, want)?;
        self.length -= chunk.size();
        Some(chunk)
    }

    /// 当前缓冲总尺寸。
    pub fn peek_length(&self) -> usize {
        self.length
    }

    /// 队首单元尺寸，空队列返回 0。
    pub fn first_size(&self) -> usize {
        self.queue.front().map_or(0, Chunk::size)
    }

    /// 缓冲中的单元个数。
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 丢弃全部单元，返回被丢弃的计量单位数。
    pub fn clear(&mut self) -> usize {
        let dropped = self.length;
        self.queue.clear();
        self.length = 0;
        dropped
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn set_high_water_mark(&mut self, high_water_mark: usize) {
        self.high_water_mark = high_water_mark;
    }

    /// 缓冲是否已达到或超过高水位。
    pub fn is_at_capacity(&self) -> bool {
        self.length >= self.high_water_mark
    }
}
