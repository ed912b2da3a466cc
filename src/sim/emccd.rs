// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::pattern;
use crate::{
    emccd::{
        Ampli, CropMode, CropSolution, CropState, CtrlTimestamp, EmccdCamera, Param, ProcContext,
        ProcType, Range, ReadoutMode, ShutterMode, TimestampMode, AUTO_CHANNEL, AUTO_UNIT,
    },
    error::{Error, Result, Sdk},
    frame::{self, Frame, Pixels},
};
use std::{
    collections::VecDeque,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

pub const SENSOR_WIDTH: u32 = 512;
pub const SENSOR_HEIGHT: u32 = 512;
/// Pixels clocked out per row besides the image pixels.
const SERIAL_OVERHEAD: u32 = 32;
/// Rows shifted around a cropped ROI when uniform line noise is requested.
const UNIFORM_PADDING_ROWS: u32 = 16;
/// Controller timestamps kept for lookup.
const STAMP_HISTORY: usize = 64;
/// Cooler time constant, per second.
const COOLING_RATE: f64 = 0.1;

const CALIBRATED_EM_GAIN: Range<i32> = Range {
    min: 1,
    max: 5000,
};
const RAW_EM_GAIN: Range<i32> = Range { min: 0, max: 4095 };
const ANALOG_GAIN: Range<i32> = Range { min: 1, max: 6 };
const ANALOG_OFFSET: Range<i32> = Range { min: 0, max: 4095 };
const TARGET_TEMPERATURE: Range<f64> = Range {
    min: -85.0,
    max: 20.0,
};
const CALIBRATED_TEMPERATURE: Range<f64> = Range {
    min: -85.0,
    max: -40.0,
};

fn readout_modes() -> Vec<ReadoutMode> {
    [
        (Ampli::Em, 20.0, 1.0),
        (Ampli::Em, 10.0, 1.0),
        (Ampli::Conv, 5.0, 0.5),
        (Ampli::Conv, 1.0, 0.5),
    ]
    .into_iter()
    .zip(1..)
    .map(|((ampli, hf, vf), index)| ReadoutMode {
        index,
        ampli,
        ampli_name: ampli.name().to_owned(),
        vertical_freq: vf,
        horizontal_freq: hf,
    })
    .collect()
}

/// Builder for [`SimEmccd`].
#[derive(Clone, Debug)]
pub struct SimEmccdBuilder {
    real_time: bool,
    calibrated_em_gain: bool,
    ctrl_timestamp: bool,
    timestamp_fail_after: Option<u64>,
    overrun_every: Option<u64>,
    loop_buffers: u32,
    initial_temperature: f64,
}

impl Default for SimEmccdBuilder {
    fn default() -> Self {
        Self {
            real_time: false,
            calibrated_em_gain: true,
            ctrl_timestamp: true,
            timestamp_fail_after: None,
            overrun_every: None,
            loop_buffers: crate::emccd::DEFAULT_LOOP_BUFFERS,
            initial_temperature: 20.0,
        }
    }
}

impl SimEmccdBuilder {
    /// Sleep for the simulated frame period on each read.
    pub fn real_time(mut self, enable: bool) -> Self {
        self.real_time = enable;
        self
    }

    pub fn calibrated_em_gain(mut self, enable: bool) -> Self {
        self.calibrated_em_gain = enable;
        self
    }

    pub fn ctrl_timestamp(mut self, enable: bool) -> Self {
        self.ctrl_timestamp = enable;
        self
    }

    /// Stops attaching controller timestamps after `n` images.
    pub fn timestamp_fail_after(mut self, n: u64) -> Self {
        self.timestamp_fail_after = Some(n);
        self
    }

    /// Flags every `n`th image read as overrun, dropping one image each time.
    pub fn overrun_every(mut self, n: u64) -> Self {
        self.overrun_every = Some(n.max(1));
        self
    }

    pub fn loop_buffers(mut self, n: u32) -> Self {
        self.loop_buffers = n.max(1);
        self
    }

    pub fn initial_temperature(mut self, celsius: f64) -> Self {
        self.initial_temperature = celsius;
        self
    }

    pub fn build(self) -> SimEmccd {
        SimEmccd::from_builder(self)
    }
}

#[derive(Copy, Clone, Debug)]
struct Cooler {
    start: f64,
    setpoint: f64,
    since: Instant,
}

impl Cooler {
    /// Exponential approach to the setpoint.
    fn current(&self) -> f64 {
        let dt = self.since.elapsed().as_secs_f64();
        self.setpoint + (self.start - self.setpoint) * (-COOLING_RATE * dt).exp()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Rect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Simulated EMCCD camera.
///
/// Time advances on a virtual clock by one frame period per image, so
/// timing loops produce the figures the real camera would without waiting
/// for them unless real-time mode is enabled.
pub struct SimEmccd {
    cfg: SimEmccdBuilder,
    modes: Vec<ReadoutMode>,
    mode: u32,
    exposure_ms: f64,
    waiting_ms: f64,
    timeout_ms: i32,
    shutter: ShutterMode,

    acquiring: bool,
    remaining: Option<u32>,
    prepared: u32,
    next_id: u64,
    delivered: u64,
    last_read: Option<Instant>,

    clock_ms: f64,
    day_offset_ms: f64,
    timer_base_ms: f64,
    stamps: VecDeque<(u64, f64)>,
    timestamp_mode: TimestampMode,

    overrun: bool,
    dropped: u32,

    calibrated_gain: i32,
    raw_gain: i32,
    analog_gain: i32,
    analog_offset: i32,
    cooler: Cooler,

    binning: (u32, u32),
    pending_roi: Rect,
    roi: Rect,
    crop: CropState,

    proc: Option<ProcContext>,
    proc_type: ProcType,
    pc_images: u32,
    event: Option<kanal::Sender<u64>>,
}

impl SimEmccd {
    pub fn builder() -> SimEmccdBuilder {
        SimEmccdBuilder::default()
    }

    /// Opens the simulated channel. Only the automatic or first unit and
    /// channel exist.
    pub fn open(unit: i32, channel: i32, loop_buffers: u32) -> Result<Self> {
        if !matches!(unit, AUTO_UNIT | 0) || !matches!(channel, AUTO_CHANNEL | 0) {
            return Err(Error::NoCamera);
        }
        if loop_buffers == 0 {
            return Err(Error::vendor(Sdk::Emccd, "open", -1));
        }
        Ok(Self::builder()
            .loop_buffers(loop_buffers)
            .real_time(true)
            .build())
    }

    fn from_builder(cfg: SimEmccdBuilder) -> Self {
        let full = Rect {
            x: 0,
            y: 0,
            width: SENSOR_WIDTH,
            height: SENSOR_HEIGHT,
        };
        let now = frame::now();
        let day_offset_ms =
            (now.seconds().rem_euclid(86_400) as f64) * 1000.0 + f64::from(now.subsec(3));
        info!("simulated EMCCD camera opened");
        Self {
            modes: readout_modes(),
            mode: 1,
            exposure_ms: 0.0,
            waiting_ms: 0.0,
            timeout_ms: 1000,
            shutter: ShutterMode::Close,
            acquiring: false,
            remaining: Some(0),
            prepared: 1,
            next_id: 0,
            delivered: 0,
            last_read: None,
            clock_ms: 0.0,
            day_offset_ms,
            timer_base_ms: 0.0,
            stamps: VecDeque::with_capacity(STAMP_HISTORY),
            timestamp_mode: TimestampMode::None,
            overrun: false,
            dropped: 0,
            calibrated_gain: 1,
            raw_gain: 0,
            analog_gain: 1,
            analog_offset: 0,
            cooler: Cooler {
                start: cfg.initial_temperature,
                setpoint: cfg.initial_temperature,
                since: Instant::now(),
            },
            binning: (1, 1),
            pending_roi: full,
            roi: full,
            crop: CropState {
                mode: CropMode::Disabled,
                padding: 0,
                figure_of_merit: 1.0,
            },
            proc: None,
            proc_type: ProcType::None,
            pc_images: 1,
            event: None,
            cfg,
        }
    }

    fn current_mode(&self) -> &ReadoutMode {
        let idx = (self.mode as usize).saturating_sub(1);
        &self.modes[idx.min(self.modes.len() - 1)]
    }

    fn is_em(&self) -> bool {
        self.current_mode().ampli == Ampli::Em
    }

    fn padding_rows(padding: i32) -> u32 {
        if padding < 0 {
            UNIFORM_PADDING_ROWS
        } else {
            padding as u32
        }
    }

    /// Readout time in ms for an ROI, optionally cropped.
    fn readout_for(&self, width: u32, height: u32, crop: Option<i32>) -> f64 {
        let mode = self.current_mode();
        let (bx, by) = self.binning;
        let rows_shifted = match crop {
            Some(padding) => height + Self::padding_rows(padding),
            None => SENSOR_HEIGHT,
        };
        let out_rows = f64::from(height / by);
        let out_cols = f64::from(width / bx + SERIAL_OVERHEAD);
        let us = f64::from(rows_shifted) / mode.vertical_freq + out_rows * out_cols / mode.horizontal_freq;
        us / 1000.0
    }

    fn crop_padding(&self) -> Option<i32> {
        match self.crop.mode {
            CropMode::Disabled => None,
            CropMode::EnableX | CropMode::EnableXY => Some(self.crop.padding),
        }
    }

    fn period_ms(&self) -> f64 {
        let readout = self.readout_for(self.roi.width, self.roi.height, self.crop_padding());
        (self.exposure_ms + self.waiting_ms).max(readout)
    }

    fn out_size(&self) -> (u32, u32) {
        (
            (self.roi.width / self.binning.0).max(1),
            (self.roi.height / self.binning.1).max(1),
        )
    }

    fn not_present(what: &str) -> Error {
        Error::FeatureNotPresent(what.to_owned())
    }

    fn check_range<T: PartialOrd + Copy + std::fmt::Display>(
        what: &str,
        r: Range<T>,
        v: T,
    ) -> Result<()> {
        if v < r.min || v > r.max {
            return Err(Error::InvalidArgument(format!("{what} {v} outside {r}")));
        }
        Ok(())
    }

    fn signal_factor(&self) -> f64 {
        let exposure = (self.exposure_ms / 10.0).clamp(0.05, 4.0);
        let em = if self.is_em() {
            let gain = if self.cfg.calibrated_em_gain {
                self.calibrated_gain
            } else {
                self.raw_gain
            };
            1.0 + f64::from(gain.max(1)).ln() / 4.0
        } else {
            1.0
        };
        exposure * em * f64::from(self.analog_gain)
    }

    /// Produces the next raw image and advances the clock.
    fn expose(&mut self) -> Frame {
        let (w, h) = self.out_size();
        let id = self.next_id;
        self.next_id += 1;
        self.clock_ms += self.period_ms();

        let bias = pattern::BIAS_LEVEL + (self.analog_offset / 8) as u16;
        let pixels = if self.shutter == ShutterMode::Close {
            pattern::dark(w, h, id, bias)
        } else {
            let factor = self.signal_factor();
            pattern::generate(w, h, id, pattern::BIAS_LEVEL)
                .into_iter()
                .map(|v| {
                    let signal = f64::from(v) - f64::from(pattern::BIAS_LEVEL);
                    (f64::from(bias) + signal * factor).clamp(0.0, 65535.0) as u16
                })
                .collect()
        };

        if self.stamps.len() == STAMP_HISTORY {
            self.stamps.pop_front();
        }
        self.stamps.push_back((id, self.clock_ms));
        Frame::new(w, h, Pixels::U16(pixels), id)
    }

    fn stamp(&self, frame: &Frame) -> Option<f64> {
        self.stamps
            .iter()
            .find(|(id, _)| *id == frame.frame_id)
            .map(|(_, ms)| *ms)
    }

    fn update_overrun(&mut self, period: f64) {
        self.overrun = false;
        if let Some(n) = self.cfg.overrun_every {
            if self.delivered % n == 0 {
                self.overrun = true;
                self.dropped += 1;
            }
        }
        if self.cfg.real_time {
            if let Some(last) = self.last_read {
                let elapsed = last.elapsed().as_secs_f64() * 1000.0;
                let capacity = period * f64::from(self.cfg.loop_buffers);
                if elapsed > capacity && period > 0.0 {
                    self.overrun = true;
                    self.dropped += ((elapsed - capacity) / period) as u32;
                }
            }
        }
        self.last_read = Some(Instant::now());
    }

    fn send_event(&self) {
        if let Some(tx) = &self.event {
            if tx.try_send(self.next_id).is_err() {
                trace!("image event receiver gone");
            }
        }
    }
}

impl EmccdCamera for SimEmccd {
    fn readout_mode_count(&self) -> Result<u32> {
        Ok(self.modes.len() as u32)
    }

    fn readout_mode(&self, index: u32) -> Result<ReadoutMode> {
        index
            .checked_sub(1)
            .and_then(|i| self.modes.get(i as usize))
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no readout mode {index}")))
    }

    fn current_readout_mode(&self) -> Result<u32> {
        Ok(self.mode)
    }

    fn set_readout_mode(&mut self, index: u32) -> Result<()> {
        self.readout_mode(index)?;
        self.mode = index;
        debug!("readout mode {}", self.current_mode());
        Ok(())
    }

    fn frequencies(&self, ampli: Ampli) -> Result<Vec<f64>> {
        Ok(self
            .modes
            .iter()
            .filter(|m| m.ampli == ampli)
            .map(|m| m.horizontal_freq)
            .collect())
    }

    fn readout_time(&self) -> Result<f64> {
        Ok(self.readout_for(self.roi.width, self.roi.height, self.crop_padding()))
    }

    fn exposure_time(&self) -> Result<f64> {
        Ok(self.exposure_ms)
    }

    fn set_exposure_time(&mut self, ms: f64) -> Result<()> {
        if ms < 0.0 {
            return Err(Error::InvalidArgument(format!("exposure time {ms}")));
        }
        self.exposure_ms = ms;
        Ok(())
    }

    fn waiting_time(&self) -> Result<f64> {
        Ok(self.waiting_ms)
    }

    fn set_waiting_time(&mut self, ms: f64) -> Result<()> {
        if ms < 0.0 {
            return Err(Error::InvalidArgument(format!("waiting time {ms}")));
        }
        self.waiting_ms = ms;
        Ok(())
    }

    fn timeout(&self) -> Result<i32> {
        Ok(self.timeout_ms)
    }

    fn set_timeout(&mut self, ms: i32) -> Result<()> {
        self.timeout_ms = ms;
        Ok(())
    }

    fn shutter_mode(&self) -> Result<ShutterMode> {
        Ok(self.shutter)
    }

    fn set_shutter_mode(&mut self, mode: ShutterMode) -> Result<()> {
        self.shutter = mode;
        debug!("shutter {mode:?}");
        Ok(())
    }

    fn start(&mut self, count: u32) -> Result<()> {
        self.acquiring = true;
        self.remaining = (count > 0).then_some(count);
        self.overrun = false;
        self.last_read = None;
        self.send_event();
        debug!("acquisition started for {count} images");
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        let period = self.period_ms();
        let timeout = Duration::from_millis(self.timeout_ms.max(0) as u64);
        if !self.acquiring || period > f64::from(self.timeout_ms) {
            if self.cfg.real_time {
                thread::sleep(timeout);
            }
            return Err(Error::Timeout(timeout));
        }
        if self.cfg.real_time {
            let wait = Duration::from_secs_f64(period / 1000.0);
            let since = self.last_read.map_or(Duration::ZERO, |t| t.elapsed());
            thread::sleep(wait.saturating_sub(since));
        }

        let mut frame = match self.proc_type {
            ProcType::Pc => {
                let n = self.pc_images.max(1);
                let mut last = None;
                for _ in 0..n {
                    let raw = self.expose();
                    if let Some(ctx) = self.proc.as_mut() {
                        ctx.add_pc_image(&raw)?;
                    }
                    last = Some(raw.frame_id);
                }
                let id = last.unwrap_or_default();
                match self.proc.as_mut() {
                    Some(ctx) => ctx.take_pc_image(id),
                    None => return Err(Error::InvalidArgument("bias required".to_owned())),
                }
            }
            _ => self.expose(),
        };
        if let (ProcType::Lm, Some(ctx)) = (self.proc_type, self.proc.as_ref()) {
            ctx.process_in_place(&mut frame)?;
        }
        self.delivered += 1;
        self.update_overrun(period);
        let more = match self.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n > 0
            }
            None => true,
        };
        if more {
            self.send_event();
        } else {
            self.acquiring = false;
        }
        Ok(frame)
    }

    fn host_timestamp(&self, frame: &Frame) -> Result<f64> {
        self.stamp(frame)
            .map(|ms| ms - self.timer_base_ms)
            .ok_or(Error::NoTimestamp)
    }

    fn reset_timer(&mut self, offset_ms: f64) -> Result<()> {
        self.timer_base_ms = self.clock_ms - offset_ms;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.acquiring = false;
        self.remaining = Some(0);
        debug!("acquisition aborted");
        Ok(())
    }

    fn prepare_acquisition(&mut self, count: u32) -> Result<()> {
        self.prepared = count;
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        self.start(self.prepared)
    }

    fn is_acquiring(&self) -> Result<bool> {
        Ok(self.acquiring)
    }

    fn param_available(&self, param: Param) -> Result<()> {
        let ok = match param {
            Param::CalibratedEmGain => self.cfg.calibrated_em_gain && self.is_em(),
            Param::RawEmGain => self.is_em(),
            Param::BinningX(n) => matches!(n, 1 | 2 | 4 | 8),
            Param::BinningY(n) => matches!(n, 1 | 2 | 4 | 8 | 16),
            Param::CtrlTimestamp => self.cfg.ctrl_timestamp,
            Param::CropMode => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Self::not_present(&format!("{param:?}")))
        }
    }

    fn calibrated_em_gain_range(&self) -> Result<Range<i32>> {
        self.param_available(Param::CalibratedEmGain)?;
        Ok(CALIBRATED_EM_GAIN)
    }

    fn calibrated_em_gain(&self) -> Result<i32> {
        self.param_available(Param::CalibratedEmGain)?;
        Ok(self.calibrated_gain)
    }

    fn set_calibrated_em_gain(&mut self, gain: i32) -> Result<()> {
        self.param_available(Param::CalibratedEmGain)?;
        Self::check_range("calibrated EM gain", CALIBRATED_EM_GAIN, gain)?;
        self.calibrated_gain = gain;
        Ok(())
    }

    fn raw_em_gain_range(&self) -> Result<Range<i32>> {
        self.param_available(Param::RawEmGain)?;
        Ok(RAW_EM_GAIN)
    }

    fn raw_em_gain(&self) -> Result<i32> {
        self.param_available(Param::RawEmGain)?;
        Ok(self.raw_gain)
    }

    fn set_raw_em_gain(&mut self, gain: i32) -> Result<()> {
        self.param_available(Param::RawEmGain)?;
        Self::check_range("raw EM gain", RAW_EM_GAIN, gain)?;
        self.raw_gain = gain;
        Ok(())
    }

    fn analog_gain_range(&self) -> Result<Range<i32>> {
        Ok(ANALOG_GAIN)
    }

    fn analog_gain(&self) -> Result<i32> {
        Ok(self.analog_gain)
    }

    fn set_analog_gain(&mut self, gain: i32) -> Result<()> {
        Self::check_range("analog gain", ANALOG_GAIN, gain)?;
        self.analog_gain = gain;
        Ok(())
    }

    fn analog_offset_range(&self) -> Result<Range<i32>> {
        Ok(ANALOG_OFFSET)
    }

    fn analog_offset(&self) -> Result<i32> {
        Ok(self.analog_offset)
    }

    fn set_analog_offset(&mut self, offset: i32) -> Result<()> {
        Self::check_range("analog offset", ANALOG_OFFSET, offset)?;
        self.analog_offset = offset;
        Ok(())
    }

    fn target_temperature_range(&self) -> Result<Range<f64>> {
        Ok(TARGET_TEMPERATURE)
    }

    fn calibrated_em_gain_temperature_range(&self) -> Result<Range<f64>> {
        if !self.cfg.calibrated_em_gain {
            return Err(Self::not_present("calibrated EM gain"));
        }
        Ok(CALIBRATED_TEMPERATURE)
    }

    fn target_temperature(&self) -> Result<f64> {
        Ok(self.cooler.setpoint)
    }

    fn set_target_temperature(&mut self, celsius: f64) -> Result<()> {
        Self::check_range("target temperature", TARGET_TEMPERATURE, celsius)?;
        self.cooler = Cooler {
            start: self.cooler.current(),
            setpoint: celsius,
            since: Instant::now(),
        };
        Ok(())
    }

    fn detector_temperature(&self) -> Result<f64> {
        Ok(self.cooler.current())
    }

    fn binning(&self) -> Result<(u32, u32)> {
        Ok(self.binning)
    }

    fn set_binning(&mut self, x: u32, y: u32) -> Result<()> {
        self.param_available(Param::BinningX(x))?;
        self.param_available(Param::BinningY(y))?;
        self.binning = (x, y);
        debug!("binning {x}x{y}");
        Ok(())
    }

    fn max_size(&self) -> Result<(u32, u32)> {
        Ok((SENSOR_WIDTH, SENSOR_HEIGHT))
    }

    fn size(&self) -> Result<(u32, u32)> {
        Ok(self.out_size())
    }

    fn roi_size(&self, index: usize) -> Result<(u32, u32)> {
        if index != 0 {
            return Err(Error::InvalidArgument(format!("no ROI {index}")));
        }
        Ok((self.pending_roi.width, self.pending_roi.height))
    }

    fn set_roi_size(&mut self, index: usize, width: u32, height: u32) -> Result<()> {
        if index != 0 {
            return Err(Error::InvalidArgument(format!("no ROI {index}")));
        }
        Self::check_range("ROI width", Range::new(1, SENSOR_WIDTH), width)?;
        Self::check_range("ROI height", Range::new(1, SENSOR_HEIGHT), height)?;
        self.pending_roi.width = width;
        self.pending_roi.height = height;
        Ok(())
    }

    fn set_roi_position(&mut self, index: usize, x: u32, y: u32) -> Result<()> {
        if index != 0 {
            return Err(Error::InvalidArgument(format!("no ROI {index}")));
        }
        self.pending_roi.x = x;
        self.pending_roi.y = y;
        Ok(())
    }

    fn roi_apply(&mut self) -> Result<()> {
        let r = self.pending_roi;
        if r.x + r.width > SENSOR_WIDTH || r.y + r.height > SENSOR_HEIGHT {
            return Err(Error::InvalidArgument(format!(
                "ROI {}x{}+{}+{} exceeds the sensor",
                r.width, r.height, r.x, r.y
            )));
        }
        self.roi = r;
        if self.crop.mode != CropMode::Disabled {
            self.crop.figure_of_merit = self.figure_of_merit(self.crop.padding);
        }
        Ok(())
    }

    fn crop_mode(&self) -> Result<CropState> {
        Ok(self.crop)
    }

    fn set_crop_mode(&mut self, mode: CropMode, padding: i32) -> Result<()> {
        self.crop = CropState {
            mode,
            padding,
            figure_of_merit: match mode {
                CropMode::Disabled => 1.0,
                _ => self.figure_of_merit(padding),
            },
        };
        debug!("crop mode {:?}", self.crop);
        Ok(())
    }

    fn crop_solutions(
        &self,
        width: u32,
        height: u32,
        mode: CropMode,
        padding: i32,
    ) -> Result<Vec<CropSolution>> {
        if mode == CropMode::Disabled || width == 0 || width > SENSOR_WIDTH {
            return Ok(Vec::new());
        }
        let standard = self.readout_for(width, height, None);
        let cropped = self.readout_for(width, height, Some(padding));
        let best = (standard / cropped) as f32;
        let windows = SENSOR_WIDTH / width;
        Ok((0..windows)
            .map(|k| {
                let min = k * width;
                let max = ((k + 1) * width).min(SENSOR_WIDTH - width);
                CropSolution {
                    figure_of_merit: best * (1.0 - 0.05 * k as f32),
                    offset_x_min: min as i32,
                    offset_x_max: max as i32,
                }
            })
            .collect())
    }

    fn set_timestamp_mode(&mut self, mode: TimestampMode) -> Result<()> {
        if mode != TimestampMode::None {
            self.param_available(Param::CtrlTimestamp)?;
        }
        self.timestamp_mode = mode;
        Ok(())
    }

    fn ctrl_timestamp(&self, frame: &Frame) -> Result<CtrlTimestamp> {
        if self.timestamp_mode == TimestampMode::None || !self.cfg.ctrl_timestamp {
            return Err(Error::NoTimestamp);
        }
        if let Some(n) = self.cfg.timestamp_fail_after {
            if frame.frame_id >= n {
                return Err(Error::NoTimestamp);
            }
        }
        let ms = self.stamp(frame).ok_or(Error::NoTimestamp)?;
        Ok(CtrlTimestamp::from_ms_in_day(self.day_offset_ms + ms))
    }

    fn overrun(&self) -> Result<bool> {
        Ok(self.overrun)
    }

    fn dropped_images(&self) -> Result<u32> {
        Ok(self.dropped)
    }

    fn framerate(&self) -> Result<f64> {
        let period = self.period_ms();
        Ok(if period > 0.0 { 1000.0 / period } else { 0.0 })
    }

    fn create_bias(&mut self, stack: u32) -> Result<()> {
        if stack == 0 {
            return Err(Error::InvalidArgument("empty bias stack".to_owned()));
        }
        let (w, h) = self.out_size();
        let mut ctx = ProcContext::new(w, h);
        let shutter = self.shutter;
        self.shutter = ShutterMode::Close;
        for _ in 0..stack {
            let dark = self.expose();
            ctx.add_bias_image(&dark)?;
        }
        self.shutter = shutter;
        ctx.compute_bias()?;
        ctx.set_proc_type(self.proc_type);
        self.proc = Some(ctx);
        info!("bias created from {stack} images");
        Ok(())
    }

    fn set_proc_type(&mut self, proc: ProcType, pc_images: u32) -> Result<()> {
        if proc != ProcType::None && self.proc.is_none() {
            return Err(Error::InvalidArgument(
                "processing requires a bias".to_owned(),
            ));
        }
        self.proc_type = proc;
        self.pc_images = pc_images.max(1);
        if let Some(ctx) = self.proc.as_mut() {
            ctx.set_proc_type(proc);
        }
        Ok(())
    }

    fn set_image_event(&mut self, event: Option<kanal::Sender<u64>>) -> Result<()> {
        self.event = event;
        Ok(())
    }
}

impl SimEmccd {
    fn figure_of_merit(&self, padding: i32) -> f32 {
        let standard = self.readout_for(self.roi.width, self.roi.height, None);
        let cropped = self.readout_for(self.roi.width, self.roi.height, Some(padding));
        (standard / cropped) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emccd::{em_gain_median, set_em_gain};

    #[test]
    fn counted_acquisition_stops() {
        let mut cam = SimEmccd::builder().build();
        cam.set_timeout(100).unwrap();
        cam.start(2).unwrap();
        assert!(cam.read().is_ok());
        assert!(cam.is_acquiring().unwrap());
        assert!(cam.read().is_ok());
        assert!(!cam.is_acquiring().unwrap());
        assert!(matches!(cam.read(), Err(Error::Timeout(_))));
    }

    #[test]
    fn crop_mode_speeds_up_small_roi() {
        let mut cam = SimEmccd::builder().build();
        crate::emccd::set_roi(&mut cam, 64, 64).unwrap();
        let standard = cam.readout_time().unwrap();
        cam.set_crop_mode(CropMode::EnableX, 0).unwrap();
        let cropped = cam.readout_time().unwrap();
        assert!(cropped < standard);
        assert!(cam.crop_mode().unwrap().figure_of_merit > 1.0);

        let solutions = cam.crop_solutions(64, 64, CropMode::EnableX, 0).unwrap();
        assert!(!solutions.is_empty());
        assert!(solutions
            .windows(2)
            .all(|w| w[0].figure_of_merit >= w[1].figure_of_merit));
    }

    #[test]
    fn host_timestamps_follow_frame_period() {
        let mut cam = SimEmccd::builder().build();
        cam.set_exposure_time(20.0).unwrap();
        cam.reset_timer(0.0).unwrap();
        cam.start(0).unwrap();
        let (_, t0) = cam.read_timed().unwrap();
        let (_, t1) = cam.read_timed().unwrap();
        assert!((t1 - t0 - 20.0).abs() < 1e-6);
    }

    #[test]
    fn ctrl_timestamp_needs_internal_mode() {
        let mut cam = SimEmccd::builder().timestamp_fail_after(1).build();
        cam.start(0).unwrap();
        let first = cam.read().unwrap();
        assert!(matches!(cam.ctrl_timestamp(&first), Err(Error::NoTimestamp)));

        cam.set_timestamp_mode(TimestampMode::Internal).unwrap();
        assert!(cam.ctrl_timestamp(&first).is_ok());
        let second = cam.read().unwrap();
        assert!(matches!(cam.ctrl_timestamp(&second), Err(Error::NoTimestamp)));
    }

    #[test]
    fn image_events_announce_each_frame() {
        let (tx, rx) = kanal::unbounded();
        let mut cam = SimEmccd::builder().build();
        cam.set_image_event(Some(tx)).unwrap();
        cam.start(2).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(0));
        cam.read().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(1));
        cam.read().unwrap();
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn overruns_count_dropped_images() {
        let mut cam = SimEmccd::builder().overrun_every(2).build();
        cam.start(0).unwrap();
        cam.read().unwrap();
        assert!(!cam.overrun().unwrap());
        cam.read().unwrap();
        assert!(cam.overrun().unwrap());
        assert_eq!(cam.dropped_images().unwrap(), 1);
    }

    #[test]
    fn raw_gain_used_without_calibration() {
        let mut cam = SimEmccd::builder().calibrated_em_gain(false).build();
        let gain = set_em_gain(&mut cam, em_gain_median, None).unwrap();
        assert_eq!(gain, Some(2047));
        assert_eq!(cam.raw_em_gain().unwrap(), 2047);

        cam.set_readout_mode(3).unwrap();
        assert_eq!(set_em_gain(&mut cam, em_gain_median, None).unwrap(), None);
    }

    #[test]
    fn processing_requires_bias() {
        let mut cam = SimEmccd::builder().build();
        assert!(cam.set_proc_type(ProcType::Lm, 0).is_err());
        cam.create_bias(4).unwrap();
        cam.set_proc_type(ProcType::Lm, 0).unwrap();
        cam.start(1).unwrap();
        let frame = cam.read().unwrap();
        assert_eq!(frame.width(), SENSOR_WIDTH);
    }

    #[test]
    fn other_units_are_absent() {
        assert!(matches!(SimEmccd::open(3, AUTO_CHANNEL, 4), Err(Error::NoCamera)));
    }
}
