use criterion::{black_box, criterion_group, criterion_main, Criterion};
use raft_imitate::{AppendEntries, Log, LogEntry, Message, RaftConfig, RaftState};
use std::net::SocketAddr;
use tokio::time::Instant;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn entries(count: usize, term: u64) -> Vec<LogEntry> {
    (0..count)
        .map(|i| LogEntry::new(term, format!("set key{} value{}", i, i).into_bytes()))
        .collect()
}

fn bench_log_append(c: &mut Criterion) {
    let batch = entries(64, 1);
    c.bench_function("log append 64", |b| {
        b.iter(|| {
            let mut log = Log::new();
            log.append(black_box(batch.iter().cloned()))
        })
    });
}

fn bench_log_slice(c: &mut Criterion) {
    let mut log = Log::new();
    log.append(entries(10_000, 1));
    c.bench_function("log slice tail", |b| {
        b.iter(|| log.slice(black_box(9_937)).iter().take(64).count())
    });
}

fn bench_follower_append_entries(c: &mut Criterion) {
    let now = Instant::now();
    let batch = entries(64, 1);
    c.bench_function("follower append_entries 64", |b| {
        b.iter(|| {
            let mut follower = RaftState::new(addr(2), vec![addr(1), addr(3)], RaftConfig::default());
            follower.start(now);
            let request = Message::AppendEntries(AppendEntries {
                term: 1,
                leader_id: addr(1),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: batch.clone(),
                commit_index: 32,
                request_id: 1,
            });
            follower.handle(request, addr(1), now);
            black_box(follower.take_outbox())
        })
    });
}

fn bench_message_codec(c: &mut Criterion) {
    let message = Message::AppendEntries(AppendEntries {
        term: 3,
        leader_id: addr(1),
        prev_log_index: 100,
        prev_log_term: 2,
        entries: entries(16, 3),
        commit_index: 99,
        request_id: 12,
    });
    let bytes = message.encode().unwrap();
    c.bench_function("decode append_entries", |b| {
        b.iter(|| Message::decode(black_box(&bytes)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_log_append,
    bench_log_slice,
    bench_follower_append_entries,
    bench_message_codec
);
criterion_main!(benches);
