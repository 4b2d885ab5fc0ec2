//! # duplex 模块说明
//!
//! 双工端把一个可读引擎与一个可写引擎绑定为一个整体：
//! - 任一侧销毁时另一侧以同一错误销毁；
//! - 自动销毁推迟到两侧都完成：可读侧 `end` 之后需等待可写侧 `finish`，反之亦然。

use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::completion::Completion;
use crate::error::StreamError;
use crate::readable::Readable;
use crate::writable::Writable;

/// 可读 `R`、可写 `W` 的双工端。
pub struct Duplex<R: Chunk, W: Chunk> {
    readable: Readable<R>,
    writable: Writable<W>,
}

impl<R: Chunk, W: Chunk> Clone for Duplex<R, W> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<R: Chunk, W: Chunk> Duplex<R, W> {
    /// 绑定两侧。
    ///
    /// # 契约说明（What）
    /// - 绑定只持有对侧的弱引用，不延长任何一侧的生命周期；
    /// - 两侧应当尚未销毁；对已销毁的一侧绑定不会补发销毁。
    pub fn new(readable: Readable<R>, writable: Writable<W>) -> Self {
        let weak_writable = writable.downgrade();
        readable.on_destroy(move |error| {
            if let Some(writable) = weak_writable.upgrade() {
                writable.destroy(error.cloned());
            }
        });
        let controller = readable.controller();
        writable.on_destroy(move |error| controller.destroy(error.cloned()));

        let weak_writable = writable.downgrade();
        readable.set_auto_destroy_guard(Rc::new(move || {
            weak_writable
                .upgrade()
                .is_none_or(|writable| writable.state().auto_destroy && writable.is_finished())
        }));
        let controller = readable.controller();
        writable.set_auto_destroy_guard(Rc::new(move || {
            controller.upgrade().is_none_or(|readable| {
                readable.state().auto_destroy && readable.is_end_emitted()
            })
        }));

        Self { readable, writable }
    }

    pub fn readable(&self) -> &Readable<R> {
        &self.readable
    }

    pub fn writable(&self) -> &Writable<W> {
        &self.writable
    }

    /// 同时销毁两侧。
    pub fn destroy(&self, error: Option<StreamError>) {
        self.readable.destroy(error.clone());
        self.writable.destroy(error);
    }

    pub fn is_destroyed(&self) -> bool {
        self.readable.is_destroyed() && self.writable.is_destroyed()
    }

    /// 两侧都正常完成（可读侧 `end`、可写侧 `finish`）时结算的 Future。
    pub fn finished(&self) -> Completion {
        crate::finished::finished(self)
    }
}

impl<R: Chunk, W: Chunk> fmt::Debug for Duplex<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
