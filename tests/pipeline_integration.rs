//! End-to-end pipeline runs exercising the scheduling contract: priority
//! ordering, preemption of in-flight deliveries, release-time holding,
//! drops, behind-schedule accounting, and error classification.
//!
//! Wall-clock assertions use generous margins; the timing-sensitive tests
//! run sequentially via `serial_test`.

use recpipe::config::Tuning;
use recpipe::pipeline::Pipeline;
use recpipe::stage::producers::{FileProducer, TextProducer};
use recpipe::stage::sinks::{ChannelSink, CommandSink, FileSink};
use recpipe::stage::transforms::FanOut;
use recpipe::stage::{StageExt, WireFormat};
use recpipe::FeedbackSnapshot;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}

fn run_text(input: &str) -> FeedbackSnapshot {
    init_logging();
    let mut pipe = Pipeline::new();
    pipe.add_producer(TextProducer::from_string(input)).unwrap();
    pipe.add_sink(CommandSink::new()).unwrap();
    pipe.configure().unwrap();
    pipe.run().unwrap()
}

#[test]
#[serial]
fn test_sleep_and_echo_run() {
    let stats = run_text("SC|SLEEP|100\nSC|ECHO|Echo working\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert!(stats.permanent_errors.is_empty());
    assert!(stats.temporary_errors.is_empty());
    assert_eq!(stats.interruptions, 0);
    assert_eq!(stats.drops, 0);
    assert!(stats.elapsed >= Duration::from_millis(100));
}

#[test]
#[serial]
fn test_unterminated_input_is_temporary() {
    let stats = run_text("SC|HELP");
    assert_eq!(stats.records_read, 0);
    assert_eq!(stats.records_delivered, 0);
    assert_eq!(stats.temporary_errors.len(), 1);
    assert!(stats.permanent_errors.is_empty());
}

#[test]
#[serial]
fn test_record_without_fitting_sink() {
    let stats = run_text("UNKNOWN|0|6.5|Hello\n");
    assert_eq!(stats.records_read, 1);
    assert_eq!(stats.records_delivered, 0);
    assert_eq!(stats.temporary_errors.len(), 1);
    assert!(stats.permanent_errors.is_empty());
}

#[test]
#[serial]
fn test_queue_drains_after_producers_finish() {
    let stats = run_text(
        "SC|SLEEP|300\nSC|SLEEP|1\nSC|SLEEP|1\nSC|SLEEP|1\nSC|SLEEP|1\nSC|SLEEP|1\nSC|ECHO|End\n",
    );
    assert_eq!(stats.records_read, 7);
    assert_eq!(stats.records_delivered, 7);
    assert!(stats.permanent_errors.is_empty());
    assert!(stats.elapsed >= Duration::from_millis(300));
}

#[test]
#[serial]
fn test_high_priority_preempts_sleeping_delivery() {
    // the followers carry a small release time so the low-priority sleep is
    // reliably in flight when they arrive
    let mut input = String::from("[P-10]SC|SLEEP|10000\n[T100ms]SC|ECHO|HighPrio\n");
    for _ in 0..8 {
        input.push_str("[T100ms]SC|SLEEP|1\n");
    }
    let stats = run_text(&input);
    assert_eq!(stats.records_read, 10);
    assert!(stats.interruptions >= 1, "expected at least one interruption");
    // the run must end materially before the low-priority sleep would have
    assert!(
        stats.elapsed < Duration::from_millis(9000),
        "took {:?}",
        stats.elapsed
    );
    assert!(stats.records_delivered >= 9);
}

#[test]
#[serial]
fn test_low_priority_record_dropped_against_delivery() {
    let stats = run_text("SC|SLEEP|400\n[T100msP-10]SC|SLEEP|30000\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 1);
    assert_eq!(stats.drops, 1);
    assert!(stats.elapsed < Duration::from_millis(25000));
    assert!(stats.elapsed >= Duration::from_millis(400));
}

#[test]
#[serial]
fn test_high_priority_jumps_queue_of_failing_records() {
    let stats = run_text(
        "SC|SLEEP|2000\nSC|FAIL\nSC|FAIL\nSC|FAIL\nSC|FAIL\nSC|FAIL\n[P05T50ms]SC|ECHO|HighPrio\n",
    );
    assert_eq!(stats.records_read, 7);
    assert!(stats.interruptions >= 1);
    assert_eq!(stats.temporary_errors.len(), 5);
    assert_eq!(stats.records_delivered, 7);
    assert!(stats.elapsed < Duration::from_millis(2000));
}

#[test]
#[serial]
fn test_timed_record_waits_for_release() {
    let stats = run_text("SC|SLEEP|400\n[T600msP10]SC|ECHO|Timed HighPrio\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert_eq!(stats.behind_schedule, 0);
    assert!(stats.elapsed >= Duration::from_millis(600));
    assert!(stats.elapsed < Duration::from_millis(1500));
}

#[test]
#[serial]
fn test_behind_schedule_counted() {
    let stats = run_text("SC|SLEEP|500\n[T0ms]SC|ECHO|Long Delay\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert_eq!(stats.behind_schedule, 1);
    assert!(stats.elapsed >= Duration::from_millis(500));
}

#[test]
#[serial]
fn test_timed_low_priority_still_executed() {
    let stats = run_text("[T300ms]SC|ECHO|Printed\n[T500msP-99]SC|ECHO|PrintedToo\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert_eq!(stats.drops, 0);
    assert!(stats.elapsed >= Duration::from_millis(500));
}

#[test]
#[serial]
fn test_timed_low_priority_dropped_against_delivery() {
    let stats = run_text("[T500ms]SC|SLEEP|500\n[T900msP-99]SC|FAIL|Dropped\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 1);
    assert_eq!(stats.drops, 1);
    assert!(stats.temporary_errors.is_empty());
    assert!(stats.elapsed >= Duration::from_millis(1000));
}

#[test]
#[serial]
fn test_timed_high_priority_interrupts() {
    let stats = run_text("[T500ms]SC|SLEEP|500\n[T900msP33]SC|ECHO|HighPrio\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert!(stats.interruptions >= 1);
    assert!(stats.elapsed >= Duration::from_millis(880));
}

#[test]
#[serial]
fn test_run_continues_after_temporary_error() {
    let stats = run_text("SC|FAIL\nSC|SLEEP|100\n");
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);
    assert_eq!(stats.temporary_errors.len(), 1);
    assert!(stats.permanent_errors.is_empty());
    assert!(stats.elapsed >= Duration::from_millis(100));
}

#[test]
fn test_fan_out_delivers_derived_records() {
    init_logging();
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pipe = Pipeline::new();
    pipe.add_producer(TextProducer::from_string("1|2\n")).unwrap();
    pipe.add_transform(FanOut::new(3)).unwrap();
    pipe.add_sink(ChannelSink::new(tx)).unwrap();
    pipe.configure().unwrap();
    let stats = pipe.run().unwrap();

    assert_eq!(stats.records_read, 1);
    assert_eq!(stats.records_transformed, 1);
    assert_eq!(stats.records_delivered, 3);
    let received: Vec<_> = rx.try_iter().collect();
    assert_eq!(received.len(), 3);
    for record in &received {
        assert_eq!(record.root().values()[0].as_i64(), Some(1));
        assert!(record.parent().is_some());
    }
}

#[test]
fn test_unusable_sole_sink_ends_run() {
    init_logging();
    let mut pipe = Pipeline::new();
    pipe.add_producer(TextProducer::from_string("SC|ECHO|x\nSC|ECHO|y\n"))
        .unwrap();
    pipe.add_sink(FileSink::new("/can/not/be/created", WireFormat::Ascii))
        .unwrap();
    pipe.configure().unwrap();
    let stats = pipe.run().unwrap();
    assert_eq!(stats.records_delivered, 0);
    assert_eq!(stats.permanent_errors.len(), 1);
}

#[test]
fn test_failing_producer_does_not_stop_other() {
    init_logging();
    let mut pipe = Pipeline::new();
    pipe.add_producer(FileProducer::new("/does/not/exist", WireFormat::Ascii))
        .unwrap();
    pipe.add_producer(TextProducer::from_string("SC|ECHO|Second is working\n"))
        .unwrap();
    pipe.add_sink(CommandSink::new()).unwrap();
    pipe.configure().unwrap();
    let stats = pipe.run().unwrap();
    assert_eq!(stats.records_read, 1);
    assert_eq!(stats.records_delivered, 1);
    assert_eq!(stats.permanent_errors.len(), 1);
}

#[test]
#[serial]
fn test_abort_cuts_run_short() {
    init_logging();
    let mut pipe = Pipeline::new();
    pipe.add_producer(TextProducer::from_string("SC|SLEEP|30000\n"))
        .unwrap();
    pipe.add_sink(CommandSink::new()).unwrap();
    pipe.configure().unwrap();

    let handle = pipe.abort_handle();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        handle.abort();
    });
    let stats = pipe.run().unwrap();
    aborter.join().unwrap();
    assert!(stats.elapsed < Duration::from_millis(5000));
}

#[test]
fn test_file_to_file_pipeline() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("input.log");
    let output_path = dir.path().join("output.bin");
    {
        let mut input = std::fs::File::create(&input_path).unwrap();
        writeln!(input, "25|7.5|Hello").unwrap();
        writeln!(input, "[P10]I:42").unwrap();
    }

    let mut pipe = Pipeline::new();
    pipe.add_producer(FileProducer::new(&input_path, WireFormat::Ascii))
        .unwrap();
    pipe.add_sink(FileSink::new(&output_path, WireFormat::Binary))
        .unwrap();
    pipe.configure().unwrap();
    let stats = pipe.run().unwrap();
    assert_eq!(stats.records_read, 2);
    assert_eq!(stats.records_delivered, 2);

    // read the binary file back and compare against the ascii source
    let bytes = std::fs::read(&output_path).unwrap();
    let mut cursor = bytes.as_slice();
    let first = recpipe::Record::from_binary(&mut cursor).unwrap();
    let second = recpipe::Record::from_binary(&mut cursor).unwrap();
    assert_eq!(first.values()[2].as_str(), Some("Hello"));
    assert_eq!(second.priority(), 10);
    assert_eq!(second.values()[0].as_i64(), Some(42));
}

#[test]
#[serial]
fn test_overload_sheds_low_priority_records() {
    init_logging();
    let tuning = Tuning {
        drop_backlog_threshold: 4,
        ..Tuning::default()
    };
    // one long delivery keeps the consumer busy while low-priority records
    // arrive and are shed against it
    let mut input = String::from("SC|SLEEP|600\n");
    for _ in 0..8 {
        input.push_str("[P-20T100ms]SC|SLEEP|1\n");
    }
    input.push_str("[P-10T100ms]SC|ECHO|tail\n");

    let mut pipe = Pipeline::with_tuning(tuning).unwrap();
    pipe.add_producer(TextProducer::from_string(input)).unwrap();
    pipe.add_sink(CommandSink::new()).unwrap();
    pipe.configure().unwrap();
    let stats = pipe.run().unwrap();
    assert_eq!(stats.records_read, 10);
    assert!(stats.drops >= 1, "expected overload drops, got {:?}", stats);
    assert_eq!(stats.permanent_errors.len(), 0);
}
