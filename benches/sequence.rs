use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mesh_crdt::core::{IdAllocator, Sequence, SequenceOp};
use mesh_crdt::sync::{SyncMessage, ValidationLimits};

/// A sequence of `size` characters typed left to right by replica 1.
fn typed(size: usize) -> (Sequence<char>, Vec<SequenceOp<char>>) {
    let mut seq = Sequence::new();
    let mut alloc = IdAllocator::new(1);
    let ops = seq
        .local_insert_run(&mut alloc, 0, (0..size).map(|i| char::from(b'a' + (i % 26) as u8)))
        .unwrap_or_default();
    (seq, ops)
}

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_insert");

    for size in [10usize, 100, 1_000, 10_000] {
        for (label, at) in [("start", 0), ("middle", size / 2), ("end", size)] {
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                let (mut seq, _) = typed(size);
                let mut alloc = IdAllocator::new(2);
                b.iter(|| {
                    let op = seq.local_insert(&mut alloc, at, 'x');
                    black_box(op.is_ok());
                });
            });
        }
    }

    group.finish();
}

fn bench_remote_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("remote_merge");

    for size in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("in_order", size), &size, |b, &size| {
            let (_, ops) = typed(size);
            b.iter(|| {
                let mut seq = Sequence::new();
                for op in &ops {
                    let _ = seq.apply_remote(op.clone());
                }
                black_box(seq.len_visible());
            });
        });

        group.bench_with_input(BenchmarkId::new("reversed", size), &size, |b, &size| {
            let (_, ops) = typed(size);
            b.iter(|| {
                let mut seq = Sequence::new();
                for op in ops.iter().rev() {
                    let _ = seq.apply_remote(op.clone());
                }
                black_box(seq.len_visible());
            });
        });
    }

    group.finish();
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    let limits = ValidationLimits::default();

    for size in [10usize, 1_000] {
        let (_, ops) = typed(size);
        let message = SyncMessage::OperationBatch { ops };
        let bytes = message.encode().unwrap_or_default();

        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| black_box(message.encode().map(|bytes| bytes.len())));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(SyncMessage::decode(bytes, &limits).is_ok()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_local_insert, bench_remote_merge, bench_wire);
criterion_main!(benches);
