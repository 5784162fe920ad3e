use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use streamdex::storage::{IndexReader, IndexWriter, PacketSource, StreamInput};
use streamdex::{search_streams, Config, Direction, Protocol, Query, SearchRequest, StreamId};

fn build_index(path: &std::path::Path, count: usize) -> IndexReader {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut writer = IndexWriter::new(path).unwrap();
    for i in 0..count {
        let mut input = StreamInput::new(
            format!("10.1.{}.{}:{}", (i / 256) % 256, i % 256, 1024 + i % 60000).parse().unwrap(),
            format!("10.200.0.{}:{}", i % 8 + 1, [80, 443, 22, 53][i % 4]).parse().unwrap(),
            Protocol::Tcp,
        );
        let time = start + Duration::milliseconds(i as i64 * 10);
        let request = format!("USER user{} PASS secret{}\r\n", i % 97, i);
        input.push_packet(
            time,
            Direction::ClientToServer,
            PacketSource {
                filename: "bench.pcap".to_string(),
                index: i as u64 * 2,
            },
            request.as_bytes(),
        );
        input.push_packet(
            time + Duration::milliseconds(1),
            Direction::ServerToClient,
            PacketSource {
                filename: "bench.pcap".to_string(),
                index: i as u64 * 2 + 1,
            },
            if i % 10 == 0 { &b"530 denied\r\n"[..] } else { &b"230 welcome\r\n"[..] },
        );
        writer.add_stream(&input, StreamId(i as u64)).unwrap();
    }
    writer.finalize().unwrap()
}

fn bench_queries(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let reader = build_index(&dir.path().join("bench.idx"), 20_000);
    let config = Config::default();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let mut group = c.benchmark_group("search");
    for (name, text) in [
        ("id_lookup", "id:100:200"),
        ("time_range", "ftime:\"2024-01-01 0001:2024-01-01 0002\""),
        ("port_scan", "sport:443"),
        ("host_scan", "chost:10.1.3.0/24"),
        ("data_regex", "cdata:\"PASS secret1\\d{3}\\r\""),
        ("data_sequence", "cdata:USER then sdata:530"),
        ("data_variable", "@a:cdata:\"USER (?P<u>user1)\" cdata:\"USER @a:u@ \" limit:50"),
    ] {
        let query = Query::parse_at(text, start).unwrap();
        let request = SearchRequest::from_query(&query, &config);
        group.bench_function(name, |b| {
            b.iter(|| black_box(search_streams(&[&reader], &request, &config).unwrap().streams.len()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queries);
criterion_main!(benches);
