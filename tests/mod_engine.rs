use chronolite::engine::Engine;
use chronolite::errors::DbError;
use chronolite::reader::{CollectCallback, ReaderCallback};
use chronolite::settings::Settings;
use chronolite::types::{NO_DATA, QueryInterval, QueryTimePoint, Sample};
use tempfile::tempdir;

fn small_settings() -> Settings {
    let mut s = Settings::default();
    s.chunk_size = 256;
    s.chunk_per_page = 8;
    s.wal_segment_size = 128;
    s
}

fn read_all(engine: &Engine, q: &QueryInterval) -> Vec<Sample> {
    let clb = CollectCallback::new();
    engine.read_interval(q, &clb).unwrap();
    clb.wait();
    clb.take()
}

#[test]
fn single_write_readback() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    let r = engine.append(&Sample::new(7, 100, 3.14, 0));
    assert_eq!((r.writed, r.ignored), (1, 0));
    let got = read_all(&engine, &QueryInterval::new(vec![7], 0, 0, 200));
    assert_eq!(got, vec![Sample::new(7, 100, 3.14, 0)]);
    engine.stop().unwrap();
}

#[test]
fn restart_preserves_answers() {
    let dir = tempdir().unwrap();
    let q = QueryInterval::new(vec![7], 0, 0, 200);
    {
        let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
        engine.append(&Sample::new(7, 100, 3.14, 0));
        engine.stop().unwrap();
    }
    let engine = Engine::open(dir.path()).unwrap();
    let got = read_all(&engine, &q);
    assert_eq!(got, vec![Sample::new(7, 100, 3.14, 0)]);
    engine.stop().unwrap();
}

#[test]
fn reserved_flag_is_ignored() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    let r = engine.append(&Sample::new(1, 1, 0.0, NO_DATA));
    assert_eq!((r.writed, r.ignored), (0, 1));
    assert!(read_all(&engine, &QueryInterval::new(vec![1], 0, 0, 100)).is_empty());
    engine.stop().unwrap();
}

#[test]
fn wrong_interval_is_rejected_and_empty_interval_is_not() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    engine.append(&Sample::new(1, 5, 0.0, 0));

    let clb = CollectCallback::new();
    let bad = QueryInterval::new(vec![1], 0, 10, 9);
    assert!(matches!(
        engine.read_interval(&bad, &clb),
        Err(DbError::WrongInterval { from: 10, to: 9 })
    ));

    // from == to is the legal empty half-open interval
    let got = read_all(&engine, &QueryInterval::new(vec![1], 0, 5, 5));
    assert!(got.is_empty());
    engine.stop().unwrap();
}

#[test]
fn time_point_synthesizes_no_data() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    let got = engine.read_time_point(&QueryTimePoint::new(vec![42], 0, 500)).unwrap();
    assert_eq!(got.len(), 1);
    let s = got[&42];
    assert_eq!((s.id, s.time, s.value, s.flag), (42, 500, 0.0, NO_DATA));
    engine.stop().unwrap();
}

#[test]
fn time_point_returns_one_entry_per_id() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    for t in [10u64, 20, 30] {
        engine.append(&Sample::new(1, t, t as f64, 0));
    }
    engine.append(&Sample::new(2, 15, 1.5, 0));
    let got = engine.read_time_point(&QueryTimePoint::new(vec![1, 2, 3], 0, 25)).unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[&1].time, 20);
    assert_eq!(got[&2].time, 15);
    assert_eq!(got[&3].flag, NO_DATA);
    engine.stop().unwrap();
}

#[test]
fn time_point_sees_flushed_data() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    for t in 1..=50u64 {
        engine.append(&Sample::new(9, t, t as f64, 0));
    }
    engine.flush().unwrap();
    engine.append(&Sample::new(9, 60, 60.0, 0));
    let got = engine.read_time_point(&QueryTimePoint::new(vec![9], 0, 55)).unwrap();
    assert_eq!(got[&9].time, 50);
    let newest = engine.read_time_point(&QueryTimePoint::new(vec![9], 0, 100)).unwrap();
    assert_eq!(newest[&9].time, 60);
    engine.stop().unwrap();
}

#[test]
fn current_value_tracks_latest_append() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    engine.append(&Sample::new(3, 10, 1.0, 0b01));
    engine.append(&Sample::new(3, 20, 2.0, 0b10));
    let got = engine.current_value(&[3, 4], 0);
    assert_eq!(got[&3].time, 20);
    assert_eq!(got[&4].flag, NO_DATA);
    // flag-filtered view
    let masked = engine.current_value(&[3], 0b10);
    assert_eq!(masked[&3].time, 20);
    engine.stop().unwrap();
}

#[test]
fn current_value_survives_flush_and_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
        engine.append(&Sample::new(5, 100, 7.5, 0));
        engine.stop().unwrap();
    }
    let engine = Engine::open(dir.path()).unwrap();
    let got = engine.current_value(&[5], 0);
    assert_eq!((got[&5].time, got[&5].value), (100, 7.5));
    engine.stop().unwrap();
}

#[test]
fn min_max_time_across_tiers() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    assert!(engine.min_max_time(1).is_none());
    for t in 1..=300u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    engine.flush().unwrap();
    for t in 301..=320u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    assert_eq!(engine.min_max_time(1), Some((1, 320)));
    assert_eq!(engine.min_time(), Some(1));
    assert_eq!(engine.max_time(), Some(320));
    engine.stop().unwrap();
}

#[test]
fn load_and_get_result() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    for t in 1..=10u64 {
        engine.append(&Sample::new(2, t, t as f64, 0));
    }
    let qid = engine.load(&QueryInterval::new(vec![2], 0, 3, 8)).unwrap();
    let result = engine.get_result(qid).expect("result parked under query id");
    assert_eq!(result.len(), 5);
    assert!(engine.get_result(qid).is_none());
    engine.stop().unwrap();
}

#[test]
fn subscribe_delivers_matching_appends() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    let clb = std::sync::Arc::new(CollectCallback::new());
    engine.subscribe(vec![1], 0, clb.clone());
    engine.append(&Sample::new(1, 10, 1.0, 0));
    engine.append(&Sample::new(2, 11, 2.0, 0));
    engine.append(&Sample::new(1, 12, 3.0, 0));
    engine.stop().unwrap(); // joins the notifier, delivery complete
    let seen = clb.take();
    assert_eq!(seen.iter().map(|s| s.time).collect::<Vec<_>>(), vec![10, 12]);
}

#[test]
fn cancel_stops_streaming_early() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    for t in 1..=5000u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    let clb = CollectCallback::new();
    clb.cancel();
    engine.read_interval(&QueryInterval::new(vec![1], 0, 0, 10_000), &clb).unwrap();
    clb.wait(); // end() is still signalled on cancellation
    assert!(clb.take().is_empty());
    engine.stop().unwrap();
}

#[test]
fn queue_sizes_reflect_flush() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    for t in 1..=100u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    let before = engine.queue_sizes();
    assert!(before.wal_count >= 1);
    engine.flush().unwrap();
    let after = engine.queue_sizes();
    assert_eq!(after.wal_count, 0);
    assert_eq!(after.memory_chunks, 0);
    assert!(after.pages_count >= 1);
    engine.stop().unwrap();
}

#[test]
fn flag_mask_filters_interval_reads() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), small_settings()).unwrap();
    engine.append(&Sample::new(1, 1, 0.0, 0b01));
    engine.append(&Sample::new(1, 2, 0.0, 0b11));
    engine.append(&Sample::new(1, 3, 0.0, 0b10));
    let got = read_all(&engine, &QueryInterval::new(vec![1], 0b10, 0, 10));
    assert_eq!(got.iter().map(|s| s.time).collect::<Vec<_>>(), vec![2, 3]);
    engine.stop().unwrap();
}
