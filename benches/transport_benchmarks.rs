// ABOUTME: Benchmark suite for the frame codec hot paths
// ABOUTME: Measures request encoding, header decoding, and body decoding throughput

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use cql_transport::{FrameHeader, FrameReader, FrameWriter, Opcode, ProtocolVersion};
use std::time::Duration;

fn sample_query_frame(body_len: usize) -> Bytes {
    let query = "X".repeat(body_len);
    let mut writer = FrameWriter::new(ProtocolVersion::V2);
    writer.set_opcode(Opcode::Query);
    writer.write_long_string(&query);
    writer.write_u16(0x0001);
    writer.finish(7).expect("opcode declared")
}

fn response_header(body: &[u8]) -> [u8; FrameHeader::SIZE] {
    let mut raw = [0u8; FrameHeader::SIZE];
    raw[0] = 0x82;
    raw[3] = Opcode::Result as u8;
    raw[4..8].copy_from_slice(&(body.len() as u32).to_be_bytes());
    raw
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("startup", |b| {
        b.iter(|| {
            let mut writer = FrameWriter::new(ProtocolVersion::V2);
            writer.set_opcode(Opcode::Startup);
            writer.write_string_map(black_box(&[("CQL_VERSION", "3.0.0")]));
            writer.finish(0).expect("opcode declared")
        })
    });

    for &size in &[16usize, 256, 4096] {
        let query = "X".repeat(size);
        group.bench_with_input(BenchmarkId::new("query", size), &query, |b, query| {
            b.iter(|| {
                let mut writer = FrameWriter::new(ProtocolVersion::V2);
                writer.set_opcode(Opcode::Query);
                writer.write_long_string(black_box(query));
                writer.write_u16(0x0001);
                writer.finish(7).expect("opcode declared")
            })
        });
    }

    group.finish();
}

fn bench_header_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode");
    group.measurement_time(Duration::from_secs(10));

    let frame = sample_query_frame(256);
    let mut raw = [0u8; FrameHeader::SIZE];
    raw.copy_from_slice(&frame[..FrameHeader::SIZE]);
    raw[0] |= 0x80;

    group.bench_function("result", |b| {
        b.iter(|| FrameHeader::decode(black_box(&raw)).expect("valid header"))
    });

    group.finish();
}

fn bench_body_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_decode");
    group.measurement_time(Duration::from_secs(10));

    let mut writer = FrameWriter::new(ProtocolVersion::V2);
    writer.set_opcode(Opcode::Startup);
    writer.write_string_map(&[("CQL_VERSION", "3.0.0"), ("COMPRESSION", "snappy")]);
    let frame = writer.finish(0).expect("opcode declared");
    let body = Bytes::copy_from_slice(&frame[FrameHeader::SIZE..]);
    let raw = response_header(&body);
    let header = FrameHeader::decode(&raw).expect("valid header");

    group.bench_function("string_map", |b| {
        b.iter(|| {
            let mut reader =
                FrameReader::new(black_box(header), body.clone()).expect("well-formed frame");
            reader.read_string_map().expect("map decodes")
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_header_decode,
    bench_body_decode
);
criterion_main!(benches);
