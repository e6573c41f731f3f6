#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate alacdec;

use std::io::Cursor;

use alacdec::{Decoder, StreamInfo};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let (params, payload) = data.split_at(1);

    let mut stream = Vec::with_capacity(payload.len() + 8);
    stream.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    stream.extend_from_slice(b"mdat");
    stream.extend_from_slice(payload);

    let info = StreamInfo {
        sample_rate: 44100,
        channels: params[0] % 8 + 1,
        channel_mask: 0,
        bits_per_sample: 16,
        total_frames: i64::max_value(),
        max_samples_per_frame: 4096,
        history_multiplier: 40,
        initial_history: 10,
        maximum_k: 14,
    };

    let mut decoder = Decoder::new(Cursor::new(stream), info).unwrap();

    for _ in 0..64 {
        match decoder.analyze_frame() {
            Ok(Some(_)) => (),
            _ => break,
        }
    }
});
