use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kissbot_runner::supervisor::output::Utf8Chunker;
use kissbot_runner::supervisor::LogBuffer;

fn bench_log_buffer_push(c: &mut Criterion) {
    let line = "2024-01-01 12:00:00 INFO bot: processed message from #channel\n";
    let mut group = c.benchmark_group("log_buffer_push");

    for limit in [4 * 1024, 64 * 1024, 256 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            b.iter(|| {
                let mut buffer = LogBuffer::new(limit);
                for _ in 0..1_000 {
                    buffer.push(black_box(line));
                }
                black_box(buffer.len())
            });
        });
    }

    group.finish();
}

fn bench_utf8_chunker(c: &mut Criterion) {
    let text = "héllo wörld, ünïcode output from a bot 🤖\n".repeat(100);
    let bytes = text.as_bytes();

    c.bench_function("utf8_chunker_split_reads", |b| {
        b.iter(|| {
            let mut chunker = Utf8Chunker::new();
            let mut total = 0;
            // odd chunk size so multi-byte chars get cut
            for chunk in bytes.chunks(37) {
                total += chunker.decode(black_box(chunk)).len();
            }
            black_box(total)
        });
    });
}

criterion_group!(benches, bench_log_buffer_push, bench_utf8_chunker);
criterion_main!(benches);
