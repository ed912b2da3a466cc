// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::{ProcType, DEFAULT_CLAMP_LEVEL};
use crate::{
    error::{Error, Result},
    frame::{Frame, Pixels},
};
use tracing::debug;

/// Read noise multiple above the bias a pixel must exceed to count as a
/// photon.
const PC_THRESHOLD_SIGMA: f64 = 5.0;

/// Host-side bias subtraction and photon counting.
///
/// Bias images are accumulated with [`ProcContext::add_bias_image`] and
/// reduced by [`ProcContext::compute_bias`] into a per-pixel mean and a
/// global read noise estimate.
#[derive(Clone, Debug)]
pub struct ProcContext {
    width: u32,
    height: u32,
    proc: ProcType,
    clamp: u16,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    stacked: u32,
    bias: Option<Vec<f64>>,
    noise: f64,
    pc_count: Vec<u32>,
    pc_frames: u32,
}

impl ProcContext {
    pub fn new(width: u32, height: u32) -> Self {
        let n = width as usize * height as usize;
        Self {
            width,
            height,
            proc: ProcType::None,
            clamp: DEFAULT_CLAMP_LEVEL,
            sum: vec![0.0; n],
            sum_sq: vec![0.0; n],
            stacked: 0,
            bias: None,
            noise: 0.0,
            pc_count: vec![0; n],
            pc_frames: 0,
        }
    }

    fn check<'a>(&self, frame: &'a Frame) -> Result<&'a [u16]> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(Error::InvalidArgument(format!(
                "frame {}x{} does not match processing context {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        match frame.pixels() {
            Pixels::U16(p) => Ok(p),
            Pixels::U8(_) => Err(Error::InvalidArgument(
                "processing requires 16-bit frames".to_owned(),
            )),
        }
    }

    pub fn proc_type(&self) -> ProcType {
        self.proc
    }

    pub fn set_proc_type(&mut self, proc: ProcType) {
        self.proc = proc;
        self.reset_pc();
    }

    pub fn clamp_level(&self) -> u16 {
        self.clamp
    }

    pub fn set_clamp_level(&mut self, level: u16) {
        self.clamp = level;
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Read noise estimated from the bias stack, in ADU.
    pub fn noise(&self) -> f64 {
        self.noise
    }

    pub fn add_bias_image(&mut self, frame: &Frame) -> Result<()> {
        let pixels = self.check(frame)?;
        for ((s, q), &v) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(pixels) {
            let v = f64::from(v);
            *s += v;
            *q += v * v;
        }
        self.stacked += 1;
        Ok(())
    }

    /// Reduces the accumulated stack to the bias and clears the stack.
    pub fn compute_bias(&mut self) -> Result<()> {
        if self.stacked == 0 {
            return Err(Error::InvalidArgument("no bias images added".to_owned()));
        }
        let n = f64::from(self.stacked);
        let mean: Vec<f64> = self.sum.iter().map(|s| s / n).collect();
        let var = self
            .sum_sq
            .iter()
            .zip(&mean)
            .map(|(q, m)| (q / n - m * m).max(0.0))
            .sum::<f64>()
            / mean.len().max(1) as f64;
        self.noise = var.sqrt();
        debug!(
            "bias computed from {} images, read noise {:.2} ADU",
            self.stacked, self.noise
        );
        self.bias = Some(mean);
        self.sum.iter_mut().for_each(|s| *s = 0.0);
        self.sum_sq.iter_mut().for_each(|s| *s = 0.0);
        self.stacked = 0;
        Ok(())
    }

    fn bias(&self) -> Result<&[f64]> {
        self.bias
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("bias has not been computed".to_owned()))
    }

    /// Applies LM processing in place: subtracts the bias and adds the clamp
    /// level. Other processing types leave the frame untouched.
    pub fn process_in_place(&self, frame: &mut Frame) -> Result<()> {
        if self.proc != ProcType::Lm {
            return Ok(());
        }
        self.check(frame)?;
        let bias = self.bias()?;
        let clamp = f64::from(self.clamp);
        if let Pixels::U16(p) = frame.pixels_mut() {
            for (v, b) in p.iter_mut().zip(bias) {
                *v = (f64::from(*v) - b + clamp).round().clamp(0.0, 65535.0) as u16;
            }
        }
        Ok(())
    }

    /// Adds a frame to the photon counting integration.
    pub fn add_pc_image(&mut self, frame: &Frame) -> Result<()> {
        let pixels = self.check(frame)?;
        let threshold = PC_THRESHOLD_SIGMA * self.noise.max(1.0);
        let bias = self
            .bias
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("bias has not been computed".to_owned()))?;
        for ((c, &v), b) in self.pc_count.iter_mut().zip(pixels).zip(bias) {
            if f64::from(v) - b > threshold {
                *c += 1;
            }
        }
        self.pc_frames += 1;
        Ok(())
    }

    pub fn pc_frames(&self) -> u32 {
        self.pc_frames
    }

    /// Returns the photon counts integrated so far as a frame and restarts
    /// the integration.
    pub fn take_pc_image(&mut self, frame_id: u64) -> Frame {
        let counts = self
            .pc_count
            .iter()
            .map(|&c| c.min(u32::from(u16::MAX)) as u16)
            .collect();
        self.reset_pc();
        Frame::new(self.width, self.height, Pixels::U16(counts), frame_id)
    }

    fn reset_pc(&mut self) {
        self.pc_count.iter_mut().for_each(|c| *c = 0);
        self.pc_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: &[u16]) -> Frame {
        Frame::new(v.len() as u32, 1, Pixels::U16(v.to_vec()), 0)
    }

    #[test]
    fn lm_subtracts_bias_and_clamps() {
        let mut ctx = ProcContext::new(3, 1);
        ctx.add_bias_image(&frame(&[100, 200, 400])).unwrap();
        ctx.add_bias_image(&frame(&[100, 200, 400])).unwrap();
        ctx.compute_bias().unwrap();
        ctx.set_proc_type(ProcType::Lm);

        let mut img = frame(&[150, 100, 400]);
        ctx.process_in_place(&mut img).unwrap();
        assert_eq!(img.pixels(), &Pixels::U16(vec![350, 200, 300]));
    }

    #[test]
    fn pc_counts_pixels_over_threshold() {
        let mut ctx = ProcContext::new(2, 1);
        ctx.add_bias_image(&frame(&[100, 100])).unwrap();
        ctx.compute_bias().unwrap();
        ctx.set_proc_type(ProcType::Pc);
        for _ in 0..3 {
            ctx.add_pc_image(&frame(&[1000, 101])).unwrap();
        }
        assert_eq!(ctx.pc_frames(), 3);
        let pc = ctx.take_pc_image(7);
        assert_eq!(pc.pixels(), &Pixels::U16(vec![3, 0]));
        assert_eq!(ctx.pc_frames(), 0);
    }

    #[test]
    fn processing_without_bias_fails() {
        let mut ctx = ProcContext::new(1, 1);
        ctx.set_proc_type(ProcType::Lm);
        assert!(ctx.process_in_place(&mut frame(&[1])).is_err());
        assert!(ctx.compute_bias().is_err());
    }
}
