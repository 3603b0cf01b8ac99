//! Criterion benchmarks for the iKVM frame codec.
//!
//! Covers the hot input path (mouse moves and key presses are sent at the
//! rate the user produces them) and the receive side: scanning a buffer for
//! the magic marker and decoding the larger device-list replies.
//!
//! Run with:
//! ```bash
//! cargo bench --package ikvm-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ikvm_core::protocol::codec::{decode_reply, encode_reply, encode_request, find_frame};
use ikvm_core::protocol::messages::{
    AtxSignal, KeyAction, KeyCommand, MouseButton, MouseCommand, Reply, Request, StatusReply,
};
use ikvm_core::{CaptureMode, FrameRate, Resolution, SerialDevice, UsbId, VideoCapture};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_requests() -> Vec<(&'static str, Request)> {
    vec![
        (
            "MouseMove",
            Request::SendMouse(MouseCommand::Move { dx: 12, dy: -7 }),
        ),
        (
            "MouseButton",
            Request::SendMouse(MouseCommand::Button {
                action: KeyAction::Press,
                button: MouseButton::Left,
            }),
        ),
        (
            "Key",
            Request::SendKey(KeyCommand::Key {
                action: KeyAction::Press,
                code: 0x04,
            }),
        ),
        (
            "Text(64)",
            Request::SendKey(KeyCommand::Text("a".repeat(64).parse().expect("ASCII text"))),
        ),
        ("Atx", Request::SendAtx(AtxSignal::ShortPower)),
    ]
}

fn make_capture_list(count: usize) -> Reply {
    let modes = [(1920, 1080), (1280, 720), (1024, 768), (800, 600), (640, 480)]
        .iter()
        .filter_map(|&(w, h)| Resolution::new(w, h))
        .map(|resolution| CaptureMode {
            resolution,
            frame_rates: [5, 10, 15, 30, 60].iter().filter_map(|&f| FrameRate::new(f)).collect(),
        })
        .collect::<Vec<_>>();
    Reply::ListCap(
        (0..count)
            .map(|i| VideoCapture {
                name: format!("/dev/video{i}"),
                modes: modes.clone(),
            })
            .collect(),
    )
}

fn make_serial_list(count: usize) -> Reply {
    Reply::ListUart(
        (0..count)
            .map(|i| SerialDevice {
                name: format!("/dev/ttyUSB{i}"),
                usb_id: UsbId::new(0x1A86, 0x7523),
            })
            .collect(),
    )
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");
    for (name, req) in make_requests() {
        group.bench_with_input(BenchmarkId::new("req", name), &req, |b, req| {
            b.iter(|| encode_request(black_box(req)).expect("encode must succeed"))
        });
    }
    group.finish();
}

fn bench_decode_reply(c: &mut Criterion) {
    let replies = [
        ("Status", Reply::SendMouse(StatusReply::Success)),
        ("StatusDetail", Reply::RunMjpg(StatusReply::Error("device busy".to_string()))),
        ("ListUart(8)", make_serial_list(8)),
        ("ListCap(4)", make_capture_list(4)),
    ];

    let mut group = c.benchmark_group("decode_reply");
    for (name, reply) in &replies {
        let bytes = encode_reply(reply).expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("reply", name), &bytes, |b, bytes| {
            b.iter(|| decode_reply(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Locating a frame after a run of garbage, the worst case the receiver hits
/// when it resynchronises.
fn bench_find_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_frame");
    for garbage in [0usize, 64, 4096] {
        let mut buf = vec![0x5Au8; garbage];
        buf.extend(encode_reply(&Reply::AskAlive).expect("encode must succeed"));
        group.bench_with_input(BenchmarkId::new("garbage", garbage), &buf, |b, buf| {
            b.iter(|| find_frame(black_box(buf)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_reply, bench_find_frame);
criterion_main!(benches);
