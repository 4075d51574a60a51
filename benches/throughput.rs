//! Throughput Benchmark for TideKV
//!
//! Measures the sharded dictionary, the lock table and full command
//! dispatch under various workloads.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tidekv::db::{CommandTable, Db, Session};
use tidekv::protocol::cmd_line;
use tidekv::storage::{Dict, LockTable};

fn replica() -> Arc<Db> {
    Db::replica(Arc::new(CommandTable::builtin()))
}

/// Raw dictionary put/get
fn bench_dict(c: &mut Criterion) {
    let dict: Dict<Bytes> = Dict::new(1 << 16);

    let mut group = c.benchmark_group("dict");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_small", |b| {
        let mut i = 0u64;
        let value = Bytes::from("small_value");
        b.iter(|| {
            dict.put(Bytes::from(format!("key:{}", i)), value.clone());
            i += 1;
        });
    });

    for i in 0..100_000 {
        dict.put(Bytes::from(format!("key:{}", i)), Bytes::from("value"));
    }

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(dict.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(dict.get(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Ordered batch locking
fn bench_locks(c: &mut Criterion) {
    let locks = LockTable::new(1024);

    let mut group = c.benchmark_group("locks");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_key", |b| {
        let key = Bytes::from("key");
        b.iter(|| {
            black_box(locks.lock(&key));
        });
    });

    group.bench_function("batch_8_write_8_read", |b| {
        let writes: Vec<Bytes> = (0..8).map(|i| Bytes::from(format!("w{}", i))).collect();
        let reads: Vec<Bytes> = (0..8).map(|i| Bytes::from(format!("r{}", i))).collect();
        b.iter(|| {
            black_box(locks.lock_read_write(&writes, &reads));
        });
    });

    group.finish();
}

/// Full dispatch: lookup, versioning, locking and execution
fn bench_dispatch(c: &mut Criterion) {
    let db = replica();
    let mut session = Session::new();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i);
            black_box(db.exec(&mut session, &cmd_line(["SET", key.as_str(), "value"])));
            i += 1;
        });
    });

    group.bench_function("get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 10_000);
            black_box(db.exec(&mut session, &cmd_line(["GET", key.as_str()])));
            i += 1;
        });
    });

    group.bench_function("incr_single_counter", |b| {
        let line = cmd_line(["INCR", "counter"]);
        b.iter(|| {
            black_box(db.exec(&mut session, &line));
        });
    });

    group.bench_function("multi_exec_3_commands", |b| {
        let multi = cmd_line(["MULTI"]);
        let set = cmd_line(["SET", "a", "1"]);
        let incr = cmd_line(["INCR", "b"]);
        let push = cmd_line(["LPUSH", "c", "x"]);
        let exec = cmd_line(["EXEC"]);
        b.iter(|| {
            db.exec(&mut session, &multi);
            db.exec(&mut session, &set);
            db.exec(&mut session, &incr);
            db.exec(&mut session, &push);
            black_box(db.exec(&mut session, &exec));
        });
    });

    group.finish();
}

/// Concurrent single-key commands from several threads
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let db = replica();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let db = Arc::clone(&db);
                    thread::spawn(move || {
                        let mut session = Session::new();
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            db.exec(&mut session, &cmd_line(["SET", key.as_str(), "value"]));
                            db.exec(&mut session, &cmd_line(["GET", key.as_str()]));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(db.len());
        });
    });

    group.finish();
}

/// KEYS pattern matching
fn bench_keys(c: &mut Criterion) {
    let db = replica();
    let mut session = Session::new();

    for i in 0..1_000 {
        for prefix in ["user", "session", "cache"] {
            let key = format!("{}:{}", prefix, i);
            db.exec(&mut session, &cmd_line(["SET", key.as_str(), "data"]));
        }
    }

    let mut group = c.benchmark_group("keys");

    group.bench_function("keys_pattern", |b| {
        let line = cmd_line(["KEYS", "user:*"]);
        b.iter(|| {
            black_box(db.exec(&mut session, &line));
        });
    });

    group.bench_function("keys_all", |b| {
        let line = cmd_line(["KEYS", "*"]);
        b.iter(|| {
            black_box(db.exec(&mut session, &line));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dict,
    bench_locks,
    bench_dispatch,
    bench_concurrent,
    bench_keys,
);

criterion_main!(benches);
