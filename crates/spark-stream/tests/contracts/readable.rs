use std::cell::Cell;
use std::rc::Rc;

use spark_stream::{
    Flow, Object, OverflowPolicy, Readable, ReadableOptions, ReadablePhase, StreamError, codes,
};

use super::support::{ScriptedSource, bytes, collect, counter, error_codes, queue, texts};

#[test]
fn push_reports_backpressure_and_reads_preserve_push_order() {
    let queue = queue();
    let readable = Readable::<Object<&'static str>>::manual(
        ReadableOptions::default().with_high_water_mark(2),
        queue.handle(),
    );

    assert!(readable.push(Object("one")));
    assert!(!readable.push(Object("two")));
    assert!(
        !readable.push(Object("three")),
        "超过高水位后仍应持续报告背压"
    );
    assert_eq!(readable.readable_length(), 3, "默认策略下超限推送照常入队");

    assert_eq!(readable.read(None), Some(Object("one")));
    assert_eq!(readable.read(None), Some(Object("two")));
    assert_eq!(readable.read(None), Some(Object("three")));
    assert_eq!(readable.read(None), None);
    queue.run_until_idle();
}

#[test]
fn flowing_consumer_sees_every_chunk_in_order_then_one_end() {
    let queue = queue();
    let readable = Readable::from_iter(
        vec![bytes("a"), bytes("b"), bytes("c")],
        ReadableOptions::default(),
        queue.handle(),
    );
    let seen = collect(&readable);
    let (ends, on_end) = counter();
    readable.on_end(on_end);

    queue.run_until_idle();

    assert_eq!(texts(&seen.borrow()), ["a", "b", "c"]);
    assert_eq!(ends.get(), 1);
    assert!(readable.is_end_emitted());
    assert!(readable.is_destroyed(), "默认在 end 之后自动销毁");
}

#[test]
fn end_is_not_emitted_until_buffer_is_drained() {
    let queue = queue();
    let readable = Readable::<Object<u32>>::manual(ReadableOptions::default(), queue.handle());
    let (ends, on_end) = counter();
    readable.on_end(on_end);

    readable.push(Object(1));
    readable.end();
    queue.run_until_idle();
    assert_eq!(ends.get(), 0, "缓冲中仍有数据时不得派发 end");
    assert_eq!(readable.phase(), ReadablePhase::HasData);

    assert_eq!(readable.read(None), Some(Object(1)));
    queue.run_until_idle();
    assert_eq!(ends.get(), 1);
}

#[test]
fn unshift_returns_data_to_the_head_of_the_buffer() {
    let queue = queue();
    let readable = Readable::manual(ReadableOptions::default(), queue.handle());
    readable.push(bytes("world"));
    readable.unshift(bytes("hello "));

    let chunk = readable.read(None).expect("缓冲中应有数据");
    assert_eq!(&chunk[..], b"hello world");
}

#[test]
fn sized_read_waits_for_enough_data_until_end() {
    let queue = queue();
    let readable = Readable::manual(ReadableOptions::default(), queue.handle());
    readable.push(bytes("abc"));

    assert_eq!(readable.read(Some(5)), None, "数据不足且未结束时不取数");
    assert_eq!(readable.readable_length(), 3);

    readable.end();
    let rest = readable.read(Some(5)).expect("结束后返回剩余数据");
    assert_eq!(&rest[..], b"abc");
    queue.run_until_idle();
    assert!(readable.is_end_emitted());
}

#[test]
fn oversized_read_raises_high_water_mark() {
    let queue = queue();
    let readable = Readable::manual(
        ReadableOptions::default().with_high_water_mark(4),
        queue.handle(),
    );
    assert!(!readable.push(bytes("abcdefgh")));

    let chunk = readable.read(Some(8)).expect("恰好 8 字节可取");
    assert_eq!(&chunk[..], b"abcdefgh");
    assert_eq!(readable.high_water_mark(), 8);
}

#[test]
fn push_after_end_is_reported_through_error_channel() {
    let queue = queue();
    let readable = Readable::manual(ReadableOptions::default(), queue.handle());
    let (codes_seen, on_error) = error_codes();
    readable.on_error(on_error);
    let (closes, on_close) = counter();
    readable.on_close(on_close);

    readable.end();
    assert!(!readable.push(bytes("late")));
    queue.run_until_idle();

    assert_eq!(*codes_seen.borrow(), [codes::PUSH_AFTER_EOF]);
    assert_eq!(closes.get(), 1);
    assert!(readable.is_destroyed());
}

#[test]
fn reject_policy_turns_overflow_into_an_error() {
    let queue = queue();
    let readable = Readable::<Object<u8>>::manual(
        ReadableOptions::default()
            .with_high_water_mark(2)
            .with_overflow(OverflowPolicy::Reject),
        queue.handle(),
    );
    let (codes_seen, on_error) = error_codes();
    readable.on_error(on_error);

    assert!(readable.push(Object(1)));
    assert!(!readable.push(Object(2)));
    assert!(!readable.push(Object(3)));
    queue.run_until_idle();

    assert_eq!(*codes_seen.borrow(), [codes::HIGH_WATER_MARK_EXCEEDED]);
    assert!(readable.is_destroyed());
    assert_eq!(readable.readable_length(), 0, "销毁丢弃缓冲");
}

#[test]
fn destroy_is_idempotent_and_keeps_the_first_error() {
    let queue = queue();
    let readable = Readable::<Object<u8>>::manual(ReadableOptions::default(), queue.handle());
    let (codes_seen, on_error) = error_codes();
    readable.on_error(on_error);
    let (closes, on_close) = counter();
    readable.on_close(on_close);

    readable.destroy(Some(StreamError::source_failed("disk gone")));
    readable.destroy(Some(StreamError::PrematureClose));
    readable.destroy(None);
    queue.run_until_idle();

    assert_eq!(*codes_seen.borrow(), [codes::SOURCE]);
    assert_eq!(closes.get(), 1);
    assert_eq!(
        readable.error().map(|error| error.code()),
        Some(codes::SOURCE)
    );
    assert!(readable.is_closed());
    assert!(!readable.push(Object(9)), "销毁后推送被静默丢弃");
}

#[test]
fn data_listener_can_pause_and_resume_later() {
    let queue = queue();
    let readable = Readable::from_iter(
        (1..=3).map(Object),
        ReadableOptions::default(),
        queue.handle(),
    );
    let seen = Rc::new(Cell::new(0u32));
    let first = Rc::new(Cell::new(true));
    {
        let seen = seen.clone();
        readable.on_data(move |chunk: &Object<u32>| {
            seen.set(chunk.0);
            if first.replace(false) {
                Flow::Pause
            } else {
                Flow::Continue
            }
        });
    }
    let (pauses, on_pause) = counter();
    readable.on_pause(on_pause);

    queue.run_until_idle();
    assert_eq!(seen.get(), 1);
    assert!(readable.is_paused());
    assert_eq!(pauses.get(), 1);

    readable.resume();
    queue.run_until_idle();
    assert_eq!(seen.get(), 3);
    assert!(readable.is_end_emitted());
}

#[test]
fn readable_listener_switches_to_pull_mode() {
    let queue = queue();
    let readable = Readable::manual(ReadableOptions::default(), queue.handle());
    let (notified, on_readable) = counter();
    readable.on_readable(on_readable);
    assert_eq!(readable.flowing(), Some(false));

    queue.run_until_idle();
    readable.push(bytes("x"));
    queue.run_until_idle();

    assert_eq!(notified.get(), 1);
    let chunk = readable.read(None).expect("通知后应可读");
    assert_eq!(&chunk[..], b"x");
}

#[test]
fn produce_is_called_again_only_after_the_previous_one_is_answered() {
    let queue = queue();
    let source = ScriptedSource::<Object<u8>>::new(Vec::new()).answer_later();
    let calls = source.calls();
    let pending = source.pending_controller();
    let readable = Readable::new(
        source,
        ReadableOptions::default().with_high_water_mark(4),
        queue.handle(),
    );

    readable.read(Some(0));
    readable.read(Some(0));
    queue.run_until_idle();
    assert_eq!(calls.get(), 1, "未应答前不得再次索取");

    let controller = pending.borrow_mut().take().expect("源已被索取");
    controller.push(Object(1));
    queue.run_until_idle();
    assert_eq!(calls.get(), 2, "应答后低于水位时自动继续索取");
    assert_eq!(readable.readable_length(), 1);
}
