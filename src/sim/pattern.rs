// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Synthetic sensor images.

/// Level of the dark background, in ADU.
pub const BIAS_LEVEL: u16 = 500;

/// Linear congruential generator with the glibc constants.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fff_ffff
}

/// Generates a 16-bit frame: a horizontal gradient, a spot orbiting the
/// centre and per-pixel read noise over a constant bias.
///
/// The output depends only on the arguments, so identical calls yield
/// identical frames.
pub fn generate(width: u32, height: u32, frame_num: u64, bias: u16) -> Vec<u16> {
    let (w, h) = (width as usize, height as usize);
    let mut buf = vec![0u16; w * h];

    let radius = f64::from(width.min(height)) / 4.0;
    let angle = frame_num as f64 * 0.1;
    let spot_x = w as f64 / 2.0 + radius * angle.cos();
    let spot_y = h as f64 / 2.0 + radius * angle.sin();
    let sigma2 = (radius / 4.0).max(1.0).powi(2);
    let seed = frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = if w > 1 { x as f64 / (w - 1) as f64 } else { 0.0 } * 20000.0;
            let dx = x as f64 - spot_x;
            let dy = y as f64 - spot_y;
            let spot = 40000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma2)).exp();
            let noise = (prng(seed ^ idx as u64) & 0xff) as f64 - 128.0;
            let v = f64::from(bias) + gradient + spot + noise;
            buf[idx] = v.clamp(0.0, 65535.0) as u16;
        }
    }
    buf
}

/// Dark frame: bias plus read noise only.
pub fn dark(width: u32, height: u32, frame_num: u64, bias: u16) -> Vec<u16> {
    let seed = frame_num.wrapping_mul(2654435761);
    (0..(width as usize * height as usize))
        .map(|idx| {
            let noise = (prng(seed ^ idx as u64) & 0xff) as i32 - 128;
            (i32::from(bias) + noise).clamp(0, 65535) as u16
        })
        .collect()
}
