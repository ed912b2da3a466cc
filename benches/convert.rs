// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use tao_camera::{
    frame::{Frame, Pixels},
    image::{self, Conversion, Image, Rotation},
};

fn ramp(width: u32, height: u32) -> Frame {
    let n = (width * height) as usize;
    Frame::new(
        width,
        height,
        Pixels::U16((0..n).map(|v| (v * 7) as u16).collect()),
        0,
    )
}

pub fn benchmark_convert(c: &mut Criterion) {
    let convs = [
        Conversion::Gray8,
        Conversion::Gray8Inverted,
        Conversion::Rgb30,
    ];
    let dims = [(128, 128), (512, 512), (1024, 1024)];

    for conv in convs.iter() {
        let mut group = c.benchmark_group(format!("convert/{conv:?}"));
        for dim in dims.iter() {
            let frame = ramp(dim.0, dim.1);
            let mut dst = Image::new(dim.0, dim.1, conv.format());
            group.bench_function(format!("{}x{}", dim.0, dim.1), |b| {
                b.iter(|| image::convert(&frame, &mut dst, *conv).unwrap())
            });
        }
    }
}

pub fn benchmark_rotate(c: &mut Criterion) {
    let mut group = c.benchmark_group("rotate");
    for dim in [(128, 128), (512, 512)].iter() {
        let img = image::to_image(&ramp(dim.0, dim.1), Conversion::Gray8).unwrap();
        for rot in [Rotation::Rotation90, Rotation::Rotation180].iter() {
            group.bench_with_input(
                format!("{}x{}-{}", dim.0, dim.1, rot.degrees()),
                &img,
                |b, img| b.iter(|| img.rotate(*rot)),
            );
        }
    }
}

criterion_group!(benches, benchmark_convert, benchmark_rotate);
criterion_main!(benches);
