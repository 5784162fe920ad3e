use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use streamdex::storage::{IndexLayout, IndexReader, IndexWriter, PacketSource, StreamInput};
use streamdex::{Direction, Protocol, StreamId};

// Streams with a request and a response of a few hundred bytes each.
fn make_streams(count: usize) -> Vec<(StreamId, StreamInput)> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let mut input = StreamInput::new(
                format!("10.{}.{}.{}:{}", i % 4, (i / 256) % 256, i % 256, 1024 + i % 60000).parse().unwrap(),
                format!("10.200.0.{}:80", i % 16 + 1).parse().unwrap(),
                Protocol::Tcp,
            );
            let time = start + Duration::milliseconds(i as i64 * 10);
            let request = format!("GET /item/{} HTTP/1.1\r\nHost: example\r\n\r\n", i).repeat(4);
            let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", i).repeat(8);
            for (n, (direction, payload)) in [
                (Direction::ClientToServer, request.as_bytes()),
                (Direction::ServerToClient, response.as_bytes()),
            ]
            .into_iter()
            .enumerate()
            {
                input.push_packet(
                    time + Duration::milliseconds(n as i64),
                    direction,
                    PacketSource {
                        filename: "bench.pcap".to_string(),
                        index: (i * 2 + n) as u64,
                    },
                    payload,
                );
            }
            (StreamId(i as u64), input)
        })
        .collect()
}

fn write(layout: &IndexLayout, streams: &[(StreamId, StreamInput)]) -> IndexReader {
    let mut writer = IndexWriter::create(layout).unwrap();
    for (id, input) in streams {
        writer.add_stream(input, *id).unwrap();
    }
    writer.finalize().unwrap()
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    let dir = tempfile::tempdir().unwrap();
    let layout = IndexLayout::new(dir.path()).unwrap();
    for count in [100, 1_000, 10_000] {
        let streams = make_streams(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &streams, |b, streams| {
            b.iter(|| {
                let reader = write(&layout, streams);
                let path = reader.path().to_path_buf();
                reader.close();
                std::fs::remove_file(path).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let layout = IndexLayout::new(dir.path()).unwrap();
    let path = write(&layout, &make_streams(10_000)).path().to_path_buf();

    c.bench_function("open_10000", |b| {
        b.iter(|| black_box(IndexReader::open(&path).unwrap().stream_count()));
    });
}

fn bench_iterate(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let layout = IndexLayout::new(dir.path()).unwrap();
    let reader = write(&layout, &make_streams(10_000));

    let mut group = c.benchmark_group("iterate");
    group.bench_function("records", |b| {
        b.iter(|| {
            let mut bytes = 0;
            for stream in reader.streams() {
                bytes += stream.unwrap().client_bytes();
            }
            black_box(bytes)
        });
    });
    group.bench_function("data", |b| {
        b.iter(|| {
            let mut chunks = 0;
            for stream in reader.streams().take(1_000) {
                chunks += stream.unwrap().data().unwrap().len();
            }
            black_box(chunks)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_open, bench_iterate);
criterion_main!(benches);
