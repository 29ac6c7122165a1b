use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use s_zip_bundle::{BundleOptions, Contents, IncomingEntry, ZipBundler};
use tokio::io::AsyncReadExt;

fn generate_compressible_data(size: usize) -> Vec<u8> {
    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        data.extend_from_slice(pattern);
    }
    data.truncate(size);
    data
}

async fn bundle(data: &[u8], entries: usize, stream_output: bool) -> usize {
    let options = BundleOptions::new("bench.zip")
        .unwrap()
        .with_stream_output(stream_output);
    let mut bundler = ZipBundler::new(options);
    for i in 0..entries {
        bundler
            .push(IncomingEntry::new(
                "/bench",
                "/bench/src",
                format!("file_{}.txt", i),
                data.to_vec(),
            ))
            .unwrap();
    }

    match bundler.finish().await.unwrap().unwrap().contents {
        Contents::Buffer(bytes) => bytes.len(),
        Contents::Stream(mut stream) => {
            let mut sink = Vec::new();
            stream.read_to_end(&mut sink).await.unwrap();
            sink.len()
        }
        Contents::Null => 0,
    }
}

fn bench_buffered_vs_streamed(c: &mut Criterion) {
    let sizes = vec![
        10 * 1024,       // 10KB
        1024 * 1024,     // 1MB
        5 * 1024 * 1024, // 5MB
    ];
    let rt = tokio::runtime::Runtime::new().unwrap();

    for size in sizes {
        let mut group = c.benchmark_group(format!("bundle_{}KB", size / 1024));
        group.throughput(Throughput::Bytes(size as u64));
        let data = generate_compressible_data(size);

        for (label, stream_output) in [("buffered", false), ("streamed", true)] {
            group.bench_with_input(BenchmarkId::new(label, size), &data, |b, data| {
                b.iter(|| rt.block_on(bundle(black_box(data), 1, stream_output)));
            });
        }

        group.finish();
    }
}

fn bench_many_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_many_entries");
    let entry_count = 50;
    let entry_size = 10 * 1024;
    group.throughput(Throughput::Bytes((entry_count * entry_size) as u64));

    let data = generate_compressible_data(entry_size);
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("50_entries", |b| {
        b.iter(|| rt.block_on(bundle(black_box(&data), entry_count, false)));
    });

    group.finish();
}

criterion_group!(benches, bench_buffered_vs_streamed, bench_many_entries);
criterion_main!(benches);
