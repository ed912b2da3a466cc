// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Low-light EMCCD camera access.
//!
//! [`EmccdCamera`] is the vendor surface; the free functions in this module
//! are the session helpers every program builds on (initialization, clamped
//! gain and temperature settings, centred regions of interest and single
//! image acquisition).

mod proc;
pub mod programs;

pub use proc::ProcContext;

use crate::{
    error::Result,
    frame::Frame,
};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Let the SDK pick the first unit found.
pub const AUTO_UNIT: i32 = -1;
/// Let the SDK pick the first channel of the unit.
pub const AUTO_CHANNEL: i32 = -1;
/// Loop buffers recommended for continuous acquisition.
pub const DEFAULT_LOOP_BUFFERS: u32 = 4;
/// Margin added to the computed read timeout.
pub const TIMEOUT_MARGIN_MS: i32 = 1000;
/// Bias clamp level applied by LM processing.
pub const DEFAULT_CLAMP_LEVEL: u16 = 300;

/// Output amplifier of a readout mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ampli {
    /// Electron multiplying
    Em,
    /// Conventional
    Conv,
}

impl Ampli {
    pub const fn name(self) -> &'static str {
        match self {
            Ampli::Em => "EM",
            Ampli::Conv => "CONV",
        }
    }
}

impl fmt::Display for Ampli {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Amplifier and clocking of one readout mode.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadoutMode {
    /// One-based mode number.
    pub index: u32,
    pub ampli: Ampli,
    pub ampli_name: String,
    /// Vertical shift frequency in MHz.
    pub vertical_freq: f64,
    /// Horizontal pixel frequency in MHz.
    pub horizontal_freq: f64,
}

impl fmt::Display for ReadoutMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "mode {}: {} ({}) vertical {} MHz horizontal {} MHz",
            self.index, self.ampli_name, self.ampli, self.vertical_freq, self.horizontal_freq
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutterMode {
    Open,
    Close,
    /// Opened during exposures only.
    Auto,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimestampMode {
    None,
    Internal,
    Gps,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CropMode {
    Disabled,
    /// Crop rows and restrict the horizontal offset to a solution window.
    EnableX,
    EnableXY,
}

/// Crop mode settings in effect.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CropState {
    pub mode: CropMode,
    /// Padding rows; 0 maximizes speed, -1 keeps line noise uniform.
    pub padding: i32,
    /// Approximate speed-up over standard ROI readout.
    pub figure_of_merit: f32,
}

/// One placement window of an ROI under crop mode.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CropSolution {
    pub figure_of_merit: f32,
    pub offset_x_min: i32,
    pub offset_x_max: i32,
}

/// Processing applied by the camera to each image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcType {
    None,
    /// Linear mode: bias subtraction with a clamp level.
    Lm,
    /// Photon counting over a number of images.
    Pc,
}

/// Optional camera features.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Param {
    CalibratedEmGain,
    RawEmGain,
    BinningX(u32),
    BinningY(u32),
    CtrlTimestamp,
    CropMode,
}

/// Controller timestamp of an image: time of day plus a sub-second fraction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CtrlTimestamp {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    /// Fraction of a second, `0.0..1.0`.
    pub fraction: f64,
}

impl CtrlTimestamp {
    pub fn from_ms_in_day(ms: f64) -> Self {
        let secs = (ms / 1000.0).floor();
        let whole = secs as u32;
        Self {
            hour: whole / 3600 % 24,
            minute: whole / 60 % 60,
            second: whole % 60,
            fraction: ms / 1000.0 - secs,
        }
    }

    /// Seconds since midnight; runs are assumed not to cross midnight.
    pub fn secs_in_day(&self) -> u32 {
        self.second + 60 * (self.minute + 60 * self.hour)
    }

    pub fn as_ms(&self) -> f64 {
        1000.0 * (f64::from(self.secs_in_day()) + self.fraction)
    }
}

impl fmt::Display for CtrlTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}",
            self.hour,
            self.minute,
            self.second,
            ((self.fraction * 1000.0) as u32).min(999)
        )
    }
}

/// Range of a device setting.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, v: T) -> T {
        if v < self.min {
            self.min
        } else if v > self.max {
            self.max
        } else {
            v
        }
    }
}

impl<T: fmt::Display> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// An opened EMCCD acquisition channel.
///
/// Times are in milliseconds, temperatures in degrees Celsius. Feature
/// probes report missing features with [`crate::error::Error::FeatureNotPresent`].
pub trait EmccdCamera: Send {
    fn readout_mode_count(&self) -> Result<u32>;
    /// Describes the one-based readout mode `index`.
    fn readout_mode(&self, index: u32) -> Result<ReadoutMode>;
    fn current_readout_mode(&self) -> Result<u32>;
    fn set_readout_mode(&mut self, index: u32) -> Result<()>;
    /// Horizontal frequencies available with an amplifier; empty when the
    /// amplifier is absent.
    fn frequencies(&self, ampli: Ampli) -> Result<Vec<f64>>;

    fn readout_time(&self) -> Result<f64>;
    fn exposure_time(&self) -> Result<f64>;
    fn set_exposure_time(&mut self, ms: f64) -> Result<()>;
    fn waiting_time(&self) -> Result<f64>;
    fn set_waiting_time(&mut self, ms: f64) -> Result<()>;
    fn timeout(&self) -> Result<i32>;
    fn set_timeout(&mut self, ms: i32) -> Result<()>;
    fn shutter_mode(&self) -> Result<ShutterMode>;
    fn set_shutter_mode(&mut self, mode: ShutterMode) -> Result<()>;

    /// Starts acquiring `count` images, or continuously when `count` is 0.
    fn start(&mut self, count: u32) -> Result<()>;
    /// Blocks until the next image is available or the timeout expires.
    fn read(&mut self) -> Result<Frame>;
    /// Host time of an image in ms since [`EmccdCamera::reset_timer`].
    fn host_timestamp(&self, frame: &Frame) -> Result<f64>;
    fn reset_timer(&mut self, offset_ms: f64) -> Result<()>;
    fn abort(&mut self) -> Result<()>;

    /// Arms the camera for `count` images without triggering them.
    fn prepare_acquisition(&mut self, count: u32) -> Result<()>;
    fn begin_acquisition(&mut self) -> Result<()>;
    fn is_acquiring(&self) -> Result<bool>;

    fn param_available(&self, param: Param) -> Result<()>;

    fn calibrated_em_gain_range(&self) -> Result<Range<i32>>;
    fn calibrated_em_gain(&self) -> Result<i32>;
    fn set_calibrated_em_gain(&mut self, gain: i32) -> Result<()>;
    fn raw_em_gain_range(&self) -> Result<Range<i32>>;
    fn raw_em_gain(&self) -> Result<i32>;
    fn set_raw_em_gain(&mut self, gain: i32) -> Result<()>;

    fn analog_gain_range(&self) -> Result<Range<i32>>;
    fn analog_gain(&self) -> Result<i32>;
    fn set_analog_gain(&mut self, gain: i32) -> Result<()>;
    fn analog_offset_range(&self) -> Result<Range<i32>>;
    fn analog_offset(&self) -> Result<i32>;
    fn set_analog_offset(&mut self, offset: i32) -> Result<()>;

    fn target_temperature_range(&self) -> Result<Range<f64>>;
    /// Temperatures at which the calibrated EM gain is valid.
    fn calibrated_em_gain_temperature_range(&self) -> Result<Range<f64>>;
    fn target_temperature(&self) -> Result<f64>;
    fn set_target_temperature(&mut self, celsius: f64) -> Result<()>;
    fn detector_temperature(&self) -> Result<f64>;

    fn binning(&self) -> Result<(u32, u32)>;
    fn set_binning(&mut self, x: u32, y: u32) -> Result<()>;
    fn max_size(&self) -> Result<(u32, u32)>;
    /// Size of the images currently delivered.
    fn size(&self) -> Result<(u32, u32)>;
    fn roi_size(&self, index: usize) -> Result<(u32, u32)>;
    fn set_roi_size(&mut self, index: usize, width: u32, height: u32) -> Result<()>;
    fn set_roi_position(&mut self, index: usize, x: u32, y: u32) -> Result<()>;
    /// Sends the pending ROI configuration to the camera.
    fn roi_apply(&mut self) -> Result<()>;

    fn crop_mode(&self) -> Result<CropState>;
    fn set_crop_mode(&mut self, mode: CropMode, padding: i32) -> Result<()>;
    /// Placements of a `width` x `height` ROI under crop mode, best first.
    fn crop_solutions(
        &self,
        width: u32,
        height: u32,
        mode: CropMode,
        padding: i32,
    ) -> Result<Vec<CropSolution>>;

    fn set_timestamp_mode(&mut self, mode: TimestampMode) -> Result<()>;
    /// Fails with [`crate::error::Error::NoTimestamp`] when the image carries none.
    fn ctrl_timestamp(&self, frame: &Frame) -> Result<CtrlTimestamp>;
    /// True when the buffer just read had been overwritten.
    fn overrun(&self) -> Result<bool>;
    fn dropped_images(&self) -> Result<u32>;
    fn framerate(&self) -> Result<f64>;

    /// Acquires `stack` dark images and stores their mean as the bias.
    fn create_bias(&mut self, stack: u32) -> Result<()>;
    /// Selects on-camera processing; `pc_images` is the photon counting
    /// integration length.
    fn set_proc_type(&mut self, proc: ProcType, pc_images: u32) -> Result<()>;
    /// Registers a channel receiving the id of each image as it arrives.
    fn set_image_event(&mut self, event: Option<kanal::Sender<u64>>) -> Result<()>;

    /// Host time of an image read, in ms since the last timer reset.
    fn read_timed(&mut self) -> Result<(Frame, f64)> {
        let frame = self.read()?;
        let ms = self.host_timestamp(&frame)?;
        Ok((frame, ms))
    }
}

/// Chooses the EM gain to apply from `(min, max, requested)`.
pub type EmGainOp = fn(i32, i32, Option<i32>) -> i32;

/// Median of the gain range.
pub fn em_gain_median(min: i32, max: i32, _requested: Option<i32>) -> i32 {
    (min + max) / 2
}

/// Requested gain when given, clamped to the range; median otherwise.
pub fn em_gain_requested(min: i32, max: i32, requested: Option<i32>) -> i32 {
    requested.map_or_else(|| em_gain_median(min, max, None), |g| g.clamp(min, max))
}

/// Timing applied by [`initialize`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Timing {
    pub readout_ms: f64,
    pub exposure_ms: f64,
    pub waiting_ms: f64,
    pub timeout_ms: i32,
}

/// Selects readout mode 1 and derives exposure, waiting time and read
/// timeout. Exposure defaults to the readout time; the waiting time is a
/// tenth of the exposure.
#[instrument(skip(cam))]
pub fn initialize(cam: &mut dyn EmccdCamera, exposure_ms: Option<f64>) -> Result<Timing> {
    cam.set_readout_mode(1)?;
    let readout_ms = cam.readout_time()?;
    let exposure_ms = exposure_ms.unwrap_or(readout_ms);
    cam.set_exposure_time(exposure_ms)?;
    let waiting_ms = 0.1 * exposure_ms;
    cam.set_waiting_time(waiting_ms)?;
    let timeout_ms = (waiting_ms + readout_ms + exposure_ms) as i32 + TIMEOUT_MARGIN_MS;
    cam.set_timeout(timeout_ms)?;
    info!(
        "initialized: readout {readout_ms:.3} ms exposure {exposure_ms:.3} ms waiting {waiting_ms:.3} ms timeout {timeout_ms} ms"
    );
    Ok(Timing {
        readout_ms,
        exposure_ms,
        waiting_ms,
        timeout_ms,
    })
}

/// Sets the EM gain chosen by `op`, preferring the calibrated gain.
///
/// Returns `None` when the current amplifier is not an EM amplifier or no
/// EM gain control exists.
pub fn set_em_gain(
    cam: &mut dyn EmccdCamera,
    op: EmGainOp,
    requested: Option<i32>,
) -> Result<Option<i32>> {
    let mode = cam.readout_mode(cam.current_readout_mode()?)?;
    if mode.ampli != Ampli::Em {
        debug!("readout mode {} has no EM amplifier", mode.index);
        return Ok(None);
    }

    match cam.param_available(Param::CalibratedEmGain) {
        Ok(()) => {
            let r = cam.calibrated_em_gain_range()?;
            let gain = op(r.min, r.max, requested);
            cam.set_calibrated_em_gain(gain)?;
            info!("calibrated EM gain set to {gain} in {r}");
            return Ok(Some(gain));
        }
        Err(e) if e.is_not_present() => {}
        Err(e) => return Err(e),
    }

    match cam.param_available(Param::RawEmGain) {
        Ok(()) => {
            let r = cam.raw_em_gain_range()?;
            let gain = op(r.min, r.max, requested);
            cam.set_raw_em_gain(gain)?;
            info!("raw EM gain set to {gain} in {r}");
            Ok(Some(gain))
        }
        Err(e) if e.is_not_present() => {
            warn!("no EM gain control available");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Applies an analog gain clamped to the device range.
pub fn set_analog_gain(cam: &mut dyn EmccdCamera, gain: i32) -> Result<i32> {
    let r = cam.analog_gain_range()?;
    let gain = r.clamp(gain);
    cam.set_analog_gain(gain)?;
    info!("analog gain set to {gain} in {r}");
    Ok(gain)
}

/// Applies an analog offset clamped to the device range.
pub fn set_analog_offset(cam: &mut dyn EmccdCamera, offset: i32) -> Result<i32> {
    let r = cam.analog_offset_range()?;
    let offset = r.clamp(offset);
    cam.set_analog_offset(offset)?;
    info!("analog offset set to {offset} in {r}");
    Ok(offset)
}

/// Temperature range targets must fall in: the calibrated EM gain range
/// when the camera has one, the plain target range otherwise.
pub fn temperature_range(cam: &dyn EmccdCamera) -> Result<Range<f64>> {
    match cam.param_available(Param::CalibratedEmGain) {
        Ok(()) => cam.calibrated_em_gain_temperature_range(),
        Err(e) if e.is_not_present() => cam.target_temperature_range(),
        Err(e) => Err(e),
    }
}

/// Sets the detector target temperature, clamped to [`temperature_range`].
pub fn set_temperature(cam: &mut dyn EmccdCamera, celsius: f64) -> Result<f64> {
    let r = temperature_range(cam)?;
    let t = r.clamp(celsius);
    cam.set_target_temperature(t)?;
    info!("target temperature set to {t:.1} C in {r}");
    Ok(t)
}

/// Region of interest applied by [`set_roi`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Clamps the size to `full` and centres the region.
    pub fn centred(full: (u32, u32), width: u32, height: u32) -> Self {
        let width = width.min(full.0);
        let height = height.min(full.1);
        Self {
            x: (full.0 - width) / 2,
            y: (full.1 - height) / 2,
            width,
            height,
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Sets the first ROI to `width` x `height`, clamped to the sensor and
/// centred on it.
pub fn set_roi(cam: &mut dyn EmccdCamera, width: u32, height: u32) -> Result<Roi> {
    let roi = Roi::centred(cam.max_size()?, width, height);
    cam.set_roi_size(0, roi.width, roi.height)?;
    cam.set_roi_position(0, roi.x, roi.y)?;
    cam.roi_apply()?;
    info!("region of interest set to {roi}");
    Ok(roi)
}

/// Opens the shutter, acquires a single image and closes the shutter.
#[instrument(skip_all)]
pub fn acquire_one(cam: &mut dyn EmccdCamera) -> Result<Frame> {
    cam.set_shutter_mode(ShutterMode::Open)?;
    let res = cam.start(1).and_then(|_| cam.read());
    let close = cam.set_shutter_mode(ShutterMode::Close);
    let frame = res?;
    close?;
    Ok(frame)
}
