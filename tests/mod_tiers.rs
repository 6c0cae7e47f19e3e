use chronolite::engine::Engine;
use chronolite::reader::CollectCallback;
use chronolite::settings::{Settings, Strategy};
use chronolite::types::{QueryInterval, Sample};
use tempfile::tempdir;

fn settings(strategy: Strategy) -> Settings {
    let mut s = Settings::default();
    s.strategy = strategy;
    s.chunk_size = 512;
    s.chunk_per_page = 16;
    s.wal_segment_size = 1024;
    s
}

fn read_all(engine: &Engine, q: &QueryInterval) -> Vec<Sample> {
    let clb = CollectCallback::new();
    engine.read_interval(q, &clb).unwrap();
    clb.take()
}

#[test]
fn interval_spans_page_and_wal_tiers() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), settings(Strategy::FastWrite)).unwrap();
    for t in 1..=10_000u64 {
        engine.append(&Sample::new(1, t, t as f64, 0));
    }
    engine.flush().unwrap();
    for t in 10_001..=11_000u64 {
        engine.append(&Sample::new(1, t, t as f64, 0));
    }

    let got = read_all(&engine, &QueryInterval::new(vec![1], 0, 5_000, 11_000));
    assert_eq!(got.len(), 6_000);
    assert!(got.windows(2).all(|w| w[0].time < w[1].time));
    assert_eq!(got.first().unwrap().time, 5_000);
    assert_eq!(got.last().unwrap().time, 10_999);
    engine.stop().unwrap();
}

#[test]
fn durability_across_eviction_and_restart() {
    let dir = tempdir().unwrap();
    let total = 5_000u64;
    {
        // memory budget of a handful of chunks forces eviction mid-stream
        let mut s = settings(Strategy::FastWrite);
        s.memory_cap = 4 * u64::from(s.chunk_size);
        s.wal_segment_size = 256;
        let engine = Engine::open_with_settings(dir.path(), s).unwrap();
        let mut writed = 0;
        for t in 1..=total {
            writed += engine.append(&Sample::new(2, t, t as f64, 0)).writed;
        }
        assert_eq!(writed as u64, total);
        engine.stop().unwrap();
    }
    let engine = Engine::open(dir.path()).unwrap();
    let got = read_all(&engine, &QueryInterval::new(vec![2], 0, 0, total + 1));
    assert_eq!(got.len() as u64, total);
    for (i, s) in got.iter().enumerate() {
        assert_eq!(s.time, i as u64 + 1);
        assert_eq!(s.value, (i as u64 + 1) as f64);
    }
    engine.stop().unwrap();
}

#[test]
fn manifest_lists_every_storage_file_on_disk() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), settings(Strategy::FastWrite)).unwrap();
    for t in 1..=3_000u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
        engine.append(&Sample::new(2, t, 0.0, 0));
    }
    engine.flush().unwrap();
    for t in 3_001..=3_100u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    let manifest = std::fs::read_to_string(dir.path().join("manifest")).unwrap();
    let listed: Vec<&str> =
        manifest.lines().filter_map(|l| l.split('\t').nth(1)).collect();
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        if name.ends_with(".page") || name.ends_with(".wal") {
            assert!(listed.contains(&name.as_str()), "{name} on disk but not in manifest");
        }
    }
    engine.stop().unwrap();
}

#[test]
fn orphan_files_are_removed_at_open() {
    let dir = tempdir().unwrap();
    {
        let engine =
            Engine::open_with_settings(dir.path(), settings(Strategy::FastWrite)).unwrap();
        engine.append(&Sample::new(1, 1, 0.0, 0));
        engine.stop().unwrap();
    }
    std::fs::write(dir.path().join("99999999.page"), b"junk").unwrap();
    std::fs::write(dir.path().join("99999999.wal"), b"junk").unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    assert!(!dir.path().join("99999999.page").exists());
    assert!(!dir.path().join("99999999.wal").exists());
    engine.stop().unwrap();
}

#[test]
fn late_write_is_accepted_and_merged() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), settings(Strategy::FastWrite)).unwrap();
    for t in [100u64, 200, 300] {
        engine.append(&Sample::new(4, t, t as f64, 0));
    }
    engine.flush().unwrap();
    // arrives after newer data was already sealed to a page
    engine.append(&Sample::new(4, 150, 1.5, 0));
    let got = read_all(&engine, &QueryInterval::new(vec![4], 0, 0, 400));
    assert_eq!(got.iter().map(|s| s.time).collect::<Vec<_>>(), vec![100, 150, 200, 300]);
    engine.stop().unwrap();
}

#[test]
fn memory_strategy_never_creates_pages() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), settings(Strategy::Memory)).unwrap();
    for t in 1..=3_000u64 {
        engine.append(&Sample::new(1, t, 0.0, 0));
    }
    engine.flush().unwrap();
    assert_eq!(engine.queue_sizes().pages_count, 0);
    let got = read_all(&engine, &QueryInterval::new(vec![1], 0, 0, 4_000));
    assert_eq!(got.len(), 3_000);
    engine.stop().unwrap();
}

#[test]
fn memory_strategy_restart_replays_wal() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open_with_settings(dir.path(), settings(Strategy::Memory)).unwrap();
        for t in 1..=500u64 {
            engine.append(&Sample::new(3, t, t as f64, 0));
        }
        engine.stop().unwrap();
    }
    let engine = Engine::open(dir.path()).unwrap();
    assert_eq!(engine.queue_sizes().pages_count, 0);
    let got = read_all(&engine, &QueryInterval::new(vec![3], 0, 0, 1_000));
    assert_eq!(got.len(), 500);
    engine.stop().unwrap();
}

#[test]
fn compressed_strategy_moves_sealed_chunks_down() {
    let dir = tempdir().unwrap();
    let mut s = settings(Strategy::Compressed);
    s.wal_segment_size = 128;
    let engine = Engine::open_with_settings(dir.path(), s).unwrap();
    for t in 1..=4_000u64 {
        engine.append(&Sample::new(1, t, t as f64, 0));
    }
    engine.flush().unwrap();
    assert!(engine.queue_sizes().pages_count >= 1);
    let got = read_all(&engine, &QueryInterval::new(vec![1], 0, 0, 5_000));
    assert_eq!(got.len(), 4_000);
    engine.stop().unwrap();
}

#[test]
fn cache_strategy_serves_from_staged_chunks() {
    let dir = tempdir().unwrap();
    let engine = Engine::open_with_settings(dir.path(), settings(Strategy::Cache)).unwrap();
    for t in 1..=2_000u64 {
        engine.append(&Sample::new(6, t, t as f64, 0));
    }
    engine.flush().unwrap();
    let q = QueryInterval::new(vec![6], 0, 0, 3_000);
    // first read stages, second read serves from the stage; both complete
    assert_eq!(read_all(&engine, &q).len(), 2_000);
    assert_eq!(read_all(&engine, &q).len(), 2_000);
    engine.stop().unwrap();
}

#[test]
fn restart_is_idempotent() {
    let dir = tempdir().unwrap();
    let q = QueryInterval::new(vec![1, 2], 0, 0, 2_000);
    let first: Vec<Sample>;
    {
        let engine =
            Engine::open_with_settings(dir.path(), settings(Strategy::FastWrite)).unwrap();
        for t in 1..=1_000u64 {
            engine.append(&Sample::new(1, t, t as f64, 0));
            engine.append(&Sample::new(2, t, -(t as f64), 0));
        }
        engine.flush().unwrap();
        first = read_all(&engine, &q);
        engine.stop().unwrap();
    }
    for _ in 0..2 {
        let engine = Engine::open(dir.path()).unwrap();
        assert_eq!(read_all(&engine, &q), first);
        engine.stop().unwrap();
    }
}
