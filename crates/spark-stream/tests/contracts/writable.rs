use std::cell::RefCell;
use std::rc::Rc;

use spark_stream::{StreamError, WritableOptions, Writable, WritablePhase, codes};

use super::support::{Ack, RecordingSink, bytes, counter, error_codes, queue, texts};

#[test]
fn completions_settle_in_write_order_when_sink_acknowledges_late() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Hold);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());

    let settled = Rc::new(RefCell::new(Vec::new()));
    for (index, text) in ["a", "b", "c"].into_iter().enumerate() {
        let settled = settled.clone();
        writable
            .write(bytes(text))
            .completion()
            .on_settled(move |outcome| {
                assert!(outcome.is_ok());
                settled.borrow_mut().push(index);
            });
    }
    assert_eq!(probe.held(), 1, "汇一次只处理一个写入");
    assert_eq!(writable.phase(), WritablePhase::Writing);

    while probe.release_next() {
        queue.run_until_idle();
    }
    queue.run_until_idle();

    assert_eq!(*settled.borrow(), [0, 1, 2]);
    assert_eq!(texts(&probe.written()), ["a", "b", "c"]);
    assert_eq!(writable.writable_length(), 0);
}

#[test]
fn write_reports_backpressure_and_drain_fires_once_when_emptied() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Hold);
    let writable = Writable::new(
        sink,
        WritableOptions::default().with_high_water_mark(4),
        queue.handle(),
    );
    let (drains, on_drain) = counter();
    writable.on_drain(on_drain);

    assert!(writable.write(bytes("ab")).is_ready());
    assert!(!writable.write(bytes("cd")).is_ready());
    assert!(writable.need_drain());

    assert!(probe.release_next());
    queue.run_until_idle();
    assert_eq!(drains.get(), 0, "缓冲未清空前不得 drain");

    assert!(probe.release_next());
    queue.run_until_idle();
    assert_eq!(drains.get(), 1);
    assert!(!writable.need_drain());
}

#[test]
fn end_waits_for_pending_writes_then_finishes() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Hold);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());
    let (finishes, on_finish) = counter();
    writable.on_finish(on_finish);
    let (closes, on_close) = counter();
    writable.on_close(on_close);

    let write = writable.write(bytes("payload")).into_completion();
    let end = writable.end();
    queue.run_until_idle();
    assert!(!end.is_settled());
    assert_eq!(probe.finish_calls(), 0, "写入未确认前不得调用 finish");
    assert!(writable.is_ending());

    assert!(probe.release_next());
    queue.run_until_idle();

    assert!(matches!(write.outcome(), Some(Ok(()))));
    assert!(matches!(end.outcome(), Some(Ok(()))));
    assert_eq!(probe.finish_calls(), 1);
    assert_eq!(finishes.get(), 1);
    assert_eq!(closes.get(), 1);
    assert!(writable.is_finished());
    assert!(writable.is_destroyed(), "默认在 finish 之后自动销毁");
}

#[test]
fn end_with_writes_the_final_chunk_first() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Sync);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());

    writable.write(bytes("head"));
    let end = writable.end_with(bytes("tail"));
    let outcome = queue.block_on(end).expect("end 应在队列推进后结算");

    assert!(outcome.is_ok());
    assert_eq!(texts(&probe.written()), ["head", "tail"]);
}

#[test]
fn write_after_end_fails_and_is_reported_once() {
    let queue = queue();
    let (sink, _probe) = RecordingSink::new(Ack::Sync);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());
    let (codes_seen, on_error) = error_codes();
    writable.on_error(on_error);

    writable.end();
    let late = writable.write(bytes("late"));
    assert!(!late.is_ready());
    queue.run_until_idle();

    let error = late
        .completion()
        .outcome()
        .and_then(Result::err)
        .expect("写入应以错误结算");
    assert_eq!(error.code(), codes::WRITE_AFTER_END);
    assert_eq!(*codes_seen.borrow(), [codes::WRITE_AFTER_END]);
}

#[test]
fn ending_a_finished_stream_fails() {
    let queue = queue();
    let (sink, _probe) = RecordingSink::new(Ack::Sync);
    let writable = Writable::<bytes::Bytes>::new(
        sink,
        WritableOptions::default().with_auto_destroy(false),
        queue.handle(),
    );
    writable.end();
    queue.run_until_idle();
    assert!(writable.is_finished());

    let again = writable.end();
    queue.run_until_idle();
    let error = again.outcome().and_then(Result::err).expect("再次结束应失败");
    assert_eq!(error.code(), codes::ALREADY_FINISHED);
}

#[test]
fn uncork_flushes_corked_writes_as_one_batch() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Sync);
    let writable = Writable::new(sink.vectored(), WritableOptions::default(), queue.handle());

    writable.cork();
    writable.cork();
    let completions: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|text| writable.write(bytes(text)).into_completion())
        .collect();
    assert_eq!(writable.phase(), WritablePhase::Corked);

    writable.uncork();
    assert!(probe.written().is_empty(), "仍有一层 cork");
    writable.uncork();
    queue.run_until_idle();

    assert_eq!(probe.batches(), [3]);
    assert_eq!(texts(&probe.written()), ["a", "b", "c"]);
    assert!(completions
        .iter()
        .all(|completion| matches!(completion.outcome(), Some(Ok(())))));
}

#[test]
fn uncork_without_vectored_sink_dispatches_one_by_one() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Sync);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());

    writable.cork();
    writable.write(bytes("a"));
    writable.write(bytes("b"));
    writable.uncork();
    queue.run_until_idle();

    assert_eq!(probe.batches(), [1, 1]);
    assert_eq!(texts(&probe.written()), ["a", "b"]);
}

#[test]
fn sink_failure_fails_the_write_and_everything_queued_behind_it() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Sync);
    probe.fail_at(1);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());
    let (codes_seen, on_error) = error_codes();
    writable.on_error(on_error);

    let first = writable.write(bytes("ok")).into_completion();
    let second = writable.write(bytes("boom")).into_completion();
    let third = writable.write(bytes("queued"));
    assert!(!third.is_ready(), "出错后写入不再报告就绪");
    queue.run_until_idle();

    assert!(matches!(first.outcome(), Some(Ok(()))));
    for failed in [second, third.into_completion()] {
        let error = failed.outcome().and_then(Result::err).expect("应以错误结算");
        assert_eq!(error.code(), codes::SINK);
    }
    assert_eq!(*codes_seen.borrow(), [codes::SINK]);
    assert!(writable.is_destroyed());
}

#[test]
fn destroy_fails_buffered_writes_and_pending_end() {
    let queue = queue();
    let (sink, probe) = RecordingSink::new(Ack::Hold);
    let writable = Writable::new(sink, WritableOptions::default(), queue.handle());
    let (closes, on_close) = counter();
    writable.on_close(on_close);

    let in_flight = writable.write(bytes("a")).into_completion();
    let buffered = writable.write(bytes("b")).into_completion();
    let end = writable.end();

    writable.destroy(None);
    writable.destroy(Some(StreamError::PrematureClose));
    queue.run_until_idle();
    assert!(!buffered.is_settled(), "在途写入确认前缓冲保持不动");

    assert!(probe.release_next());
    queue.run_until_idle();

    assert!(matches!(in_flight.outcome(), Some(Ok(()))));

    let error = buffered.outcome().and_then(Result::err).expect("缓冲写入应失败");
    assert_eq!(error.code(), codes::DESTROYED);
    let error = end.outcome().and_then(Result::err).expect("等待中的 end 应失败");
    assert_eq!(error.code(), codes::DESTROYED);
    assert_eq!(probe.destroy_calls(), 1);
    assert_eq!(closes.get(), 1);
    assert!(writable.error().is_none(), "无错误销毁不记录错误");
}
