// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use tao_camera::{
    fits::{self, Meta},
    frame::{Frame, Pixels},
    image::{encode_jpeg, to_image, Conversion},
};

fn ramp(width: u32, height: u32) -> Frame {
    let n = (width * height) as usize;
    Frame::new(
        width,
        height,
        Pixels::U16((0..n).map(|v| (v * 13) as u16).collect()),
        0,
    )
}

pub fn benchmark_encode(c: &mut Criterion) {
    let dims = [(128, 128), (512, 512), (1024, 1024)];

    let mut group = c.benchmark_group("jpeg");
    for dim in dims.iter() {
        let img = to_image(&ramp(dim.0, dim.1), Conversion::Gray8).unwrap();
        group.bench_with_input(format!("{}x{}", dim.0, dim.1), &img, |b, img| {
            b.iter(|| encode_jpeg(img, 90).unwrap())
        });
    }
    group.finish();

    let mut group = c.benchmark_group("fits");
    let meta = Meta {
        exposure_ms: Some(10.0),
        ..Meta::default()
    };
    for dim in dims.iter() {
        let frame = ramp(dim.0, dim.1);
        group.bench_with_input(format!("{}x{}", dim.0, dim.1), &frame, |b, frame| {
            b.iter(|| fits::encode(frame, &meta))
        });
    }
}

criterion_group!(benches, benchmark_encode);
criterion_main!(benches);
