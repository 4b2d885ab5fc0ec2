//! 回调内重入引擎的场景：监听器、源、汇都可以在回调中再次调用引擎。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::Bytes;
use spark_stream::{
    Done, Object, Readable, ReadableController, ReadableOptions, Sink, Source, StreamError,
    Writable, WritableOptions,
};

use super::support::{Ack, RecordingSink, bytes, collect, counter, queue, texts};

#[test]
fn data_listener_may_push_more_data() {
    let queue = queue();
    let readable = Readable::<Bytes>::manual(ReadableOptions::default(), queue.handle());
    let controller = readable.controller();
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        readable.on_data(move |chunk: &Bytes| {
            seen.borrow_mut().push(chunk.clone());
            if &chunk[..] == b"first" {
                controller.push(bytes("echo"));
            }
        });
    }
    queue.run_until_idle();

    readable.push(bytes("first"));
    readable.push(bytes("second"));
    queue.run_until_idle();

    assert_eq!(texts(&seen.borrow()), ["first", "echo", "second"]);
}

#[test]
fn pause_called_inside_data_listener_stops_before_the_next_chunk() {
    let queue = queue();
    let readable = Readable::<Object<char>>::manual(ReadableOptions::default(), queue.handle());
    for letter in ['a', 'b', 'c'] {
        readable.push(Object(letter));
    }
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        let pauser = readable.clone();
        readable.on_data(move |chunk: &Object<char>| {
            seen.borrow_mut().push(chunk.0);
            if chunk.0 == 'a' {
                pauser.pause();
            }
        });
    }

    queue.run_until_idle();
    assert_eq!(*seen.borrow(), ['a'], "监听器内暂停后不再出队");
    assert!(readable.is_paused());
    assert_eq!(readable.readable_length(), 2);

    readable.resume();
    queue.run_until_idle();
    assert_eq!(*seen.borrow(), ['a', 'b', 'c']);
    assert_eq!(readable.readable_length(), 0);
}

#[test]
fn drain_listener_may_write_again() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Hold);
    let writable = Writable::new(
        sink,
        WritableOptions::default().with_high_water_mark(1),
        queue.handle(),
    );
    {
        let again = writable.clone();
        let wrote = Cell::new(false);
        writable.once_drain(move || {
            if !wrote.replace(true) {
                again.write(bytes("after drain"));
            }
        });
    }

    assert!(!writable.write(bytes("first")).is_ready());
    assert!(probe.release_next());
    queue.run_until_idle();
    assert_eq!(probe.held(), 1, "drain 监听器中的写入立即派发");
    assert!(probe.release_next());
    queue.run_until_idle();

    assert_eq!(texts(&probe.written()), ["first", "after drain"]);
}

/// 在处理首个写入时，从汇内部再写入一次。
struct EchoSink {
    target: Rc<RefCell<Option<Writable<Bytes>>>>,
    written: Rc<RefCell<Vec<Bytes>>>,
}

impl Sink<Bytes> for EchoSink {
    fn dispatch(&mut self, chunk: Bytes, done: Done) {
        let echo = self.written.borrow().is_empty();
        self.written.borrow_mut().push(chunk);
        if echo {
            let target = self.target.borrow().clone();
            if let Some(writable) = target {
                writable.write(bytes("from sink"));
            }
        }
        done.succeed();
    }
}

#[test]
fn sink_may_write_to_its_own_stream_while_dispatching() {
    let queue = queue();
    let target = Rc::new(RefCell::new(None));
    let written = Rc::new(RefCell::new(Vec::new()));
    let writable = Writable::new(
        EchoSink {
            target: target.clone(),
            written: written.clone(),
        },
        WritableOptions::default(),
        queue.handle(),
    );
    *target.borrow_mut() = Some(writable.clone());

    writable.write(bytes("outer"));
    writable.end();
    queue.run_until_idle();
    target.borrow_mut().take();

    assert_eq!(texts(&written.borrow()), ["outer", "from sink"]);
    assert!(writable.is_finished());
}

/// 在 `produce` 中销毁自身的源。
struct SelfDestructing {
    destroyed: Rc<Cell<bool>>,
}

impl Source<Bytes> for SelfDestructing {
    fn produce(&mut self, controller: &ReadableController<Bytes>, _size: usize) {
        controller.push(bytes("last words"));
        controller.destroy(None);
        assert!(!self.destroyed.get(), "produce 返回前不得调用源的 destroy");
    }

    fn destroy(&mut self, _error: Option<&StreamError>, done: Done) {
        self.destroyed.set(true);
        done.succeed();
    }
}

#[test]
fn destroy_during_produce_is_deferred_until_produce_returns() {
    let queue = queue();
    let destroyed = Rc::new(Cell::new(false));
    let readable = Readable::new(
        SelfDestructing {
            destroyed: destroyed.clone(),
        },
        ReadableOptions::default(),
        queue.handle(),
    );
    let (closes, on_close) = counter();
    readable.on_close(on_close);

    assert_eq!(readable.read(None), None, "销毁丢弃了缓冲");
    assert!(destroyed.get());
    queue.run_until_idle();

    assert!(readable.is_destroyed());
    assert_eq!(closes.get(), 1);
}

/// 在 `produce` 中同步读取自身的源。
struct Greedy {
    readable: Rc<RefCell<Option<Readable<Bytes>>>>,
    calls: Rc<Cell<usize>>,
}

impl Source<Bytes> for Greedy {
    fn produce(&mut self, controller: &ReadableController<Bytes>, _size: usize) {
        self.calls.set(self.calls.get() + 1);
        let readable = self.readable.borrow().clone();
        if let Some(readable) = readable {
            readable.read(Some(0));
        }
        if self.calls.get() < 3 {
            controller.push(bytes("x"));
        } else {
            controller.end();
        }
    }
}

#[test]
fn nested_read_inside_produce_does_not_reenter_the_source() {
    let queue = queue();
    let slot = Rc::new(RefCell::new(None));
    let calls = Rc::new(Cell::new(0));
    let readable = Readable::new(
        Greedy {
            readable: slot.clone(),
            calls: calls.clone(),
        },
        ReadableOptions::default(),
        queue.handle(),
    );
    *slot.borrow_mut() = Some(readable.clone());
    let seen = collect(&readable);

    queue.run_until_idle();
    slot.borrow_mut().take();

    assert_eq!(calls.get(), 3);
    assert_eq!(texts(&seen.borrow()), ["x", "x"]);
    assert!(readable.is_end_emitted());
}
