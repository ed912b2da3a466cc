// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! End-to-end EMCCD workflows. Each function expects an initialized camera
//! (see [`super::initialize`]) and leaves the shutter closed.

use super::{
    acquire_one, em_gain_median, set_analog_gain, set_analog_offset, set_em_gain, set_roi,
    set_temperature, temperature_range, Ampli, CropMode, CropSolution, CtrlTimestamp,
    EmccdCamera, Param, ProcContext, ProcType, Roi, ShutterMode, TimestampMode,
    DEFAULT_CLAMP_LEVEL, TIMEOUT_MARGIN_MS,
};
use crate::{
    acquisition::{timed_loop, TimedOptions, TimedResult},
    error::{Error, Result},
    fits::Meta,
    frame::Frame,
    save::{save_frame, CubeWriter, SaveOptions},
};
use serde_json::{json, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

pub const BIAS_STACK: u32 = 50;
pub const PC_FRAMES: u32 = 100;
pub const PC_AUTO_FRAMES: u32 = 10;
pub const CUBE_DEPTH: usize = 5;
/// Crop mode solutions listed by [`maximize_framerate`].
pub const CROP_SOLUTIONS_SHOWN: usize = 5;

fn with_comment(save: &SaveOptions, comment: &str) -> SaveOptions {
    let mut opts = save.clone();
    opts.meta.comment = Some(comment.to_owned());
    opts
}

/// Runs `body` with the shutter open and an acquisition of `count` images
/// started, then aborts and closes the shutter whatever the outcome.
fn with_acquisition<T>(
    cam: &mut dyn EmccdCamera,
    count: u32,
    body: impl FnOnce(&mut dyn EmccdCamera) -> Result<T>,
) -> Result<T> {
    cam.set_shutter_mode(ShutterMode::Open)?;
    let res = cam.start(count).and_then(|_| body(&mut *cam));
    let abort = cam.abort();
    let close = cam.set_shutter_mode(ShutterMode::Close);
    let value = res?;
    abort?;
    close?;
    Ok(value)
}

/// Acquires `images` images continuously, saving each as `Image_<i>`.
#[instrument(skip(cam, save))]
pub fn continuous(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    images: u32,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    let opts = with_comment(save, "Image acquired in continuous acquisition");
    with_acquisition(cam, images, |cam| {
        (0..images)
            .map(|i| {
                let frame = cam.read()?;
                save_frame(&frame, dir, &format!("Image_{i}"), &opts)
            })
            .collect()
    })
}

/// Acquires `images` images with host timestamps relative to the start.
#[instrument(skip(cam, save))]
pub fn timed(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    images: u32,
    save: &SaveOptions,
) -> Result<Vec<(PathBuf, f64)>> {
    let opts = with_comment(save, "Timed acquisition test");
    cam.reset_timer(0.0)?;
    with_acquisition(cam, images, |cam| {
        let mut out = Vec::with_capacity(images as usize);
        for i in 0..images {
            let (frame, ms) = cam.read_timed()?;
            let path = save_frame(&frame, dir, &format!("Image_{i}"), &opts)?;
            info!("saved {} with timestamp {ms} ms", path.display());
            out.push((path, ms));
        }
        Ok(out)
    })
}

#[derive(Clone, Debug)]
pub struct TimestampReport {
    pub timestamps: Vec<CtrlTimestamp>,
    pub dropped: u32,
}

/// Acquires `images` images stamped by the controller clock.
#[instrument(skip(cam, save))]
pub fn internal_timestamp(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    images: u32,
    save: &SaveOptions,
) -> Result<TimestampReport> {
    let opts = with_comment(save, "This is part of a series of timestamped images.");
    cam.set_timestamp_mode(TimestampMode::Internal)?;
    let timestamps = with_acquisition(cam, 0, |cam| {
        let mut stamps = Vec::with_capacity(images as usize);
        for i in 0..images {
            let frame = cam.read()?;
            let ts = cam.ctrl_timestamp(&frame)?;
            info!("image {i}: {ts}");
            save_frame(&frame, dir, &format!("Image_{i}"), &opts)?;
            stamps.push(ts);
        }
        Ok(stamps)
    })?;

    let dropped = cam.dropped_images()?;
    match dropped {
        0 => {}
        1 => warn!("1 image was lost"),
        n => warn!("{n} images were lost"),
    }
    Ok(TimestampReport {
        timestamps,
        dropped,
    })
}

/// Starts a single image acquisition and waits for the image-ready event
/// before reading and saving it as `callbackImage`.
#[instrument(skip(cam, save))]
pub fn callback(cam: &mut dyn EmccdCamera, dir: &Path, save: &SaveOptions) -> Result<PathBuf> {
    let opts = with_comment(save, "This is an image grabbed from a callback function");
    let timeout = Duration::from_millis(cam.timeout()?.max(0) as u64);
    let (tx, rx) = kanal::bounded(4);
    cam.set_image_event(Some(tx))?;

    let res = with_acquisition(cam, 1, |cam| {
        let id = rx.recv_timeout(timeout).map_err(|_| Error::Timeout(timeout))?;
        debug!("image {id} ready");
        let frame = cam.read()?;
        save_frame(&frame, dir, "callbackImage", &opts)
    });
    cam.set_image_event(None)?;
    res
}

/// Acquires one image and saves it with the detector temperature added to
/// its header.
#[instrument(skip(cam))]
pub fn save_with_temperature(cam: &mut dyn EmccdCamera, dir: &Path) -> Result<PathBuf> {
    let frame = acquire_one(cam)?;
    let temperature = cam.detector_temperature()?;
    info!("appending the detector temperature ({temperature:.2} C) to the image header");
    let opts = SaveOptions {
        meta: Meta {
            comment: Some("This is an image on which an extra header will be added".to_owned()),
            exposure_ms: Some(cam.exposure_time()?),
            temperature: Some(temperature),
        },
        ..SaveOptions::default()
    };
    save_frame(&frame, dir, "newImage", &opts)
}

/// Acquires `images` images into FITS cubes of `depth` images named
/// `DataCube_<n>`.
#[instrument(skip(cam, save))]
pub fn data_cubes(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    images: u32,
    depth: usize,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    let opts = with_comment(
        save,
        &format!("Images grouped in data cubes of {depth} images"),
    );
    let mut writer = CubeWriter::new(dir, "DataCube", depth, opts)?;
    with_acquisition(cam, images, |cam| {
        for _ in 0..images {
            writer.push(cam.read()?)?;
        }
        Ok(())
    })?;
    writer.finish()
}

/// Lists the readout modes, then acquires one image per mode saved as
/// `readout_mode_<i>`.
#[instrument(skip(cam, save))]
pub fn readout_modes(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    let count = cam.readout_mode_count()?;
    info!("{count} readout modes available");
    for i in 1..=count {
        info!("{}", cam.readout_mode(i)?);
    }
    for ampli in [Ampli::Conv, Ampli::Em] {
        let freqs = cam.frequencies(ampli)?;
        if freqs.is_empty() {
            info!("no {ampli} amplifier");
        } else {
            info!("{ampli} amplifier horizontal frequencies (MHz): {freqs:?}");
        }
    }

    let opts = with_comment(save, "Readout mode test");
    let mut files = Vec::with_capacity(count as usize);
    for i in 1..=count {
        cam.set_readout_mode(i)?;
        let readout = cam.readout_time()?;
        let exposure = cam.exposure_time()?;
        let waiting = cam.waiting_time()?;
        cam.set_timeout((readout + exposure + waiting) as i32 + TIMEOUT_MARGIN_MS)?;
        info!("readout mode {i}: acquiring ({:.3} s)", readout / 1000.0);
        let frame = acquire_one(cam)?;
        files.push(save_frame(&frame, dir, &format!("readout_mode_{i}"), &opts)?);
    }
    Ok(files)
}

/// Reference image, binned images for each supported binning and an image
/// of a centred ROI an eighth of the sensor size. Restores full frame
/// readout before returning.
#[instrument(skip(cam, save))]
pub fn bin_and_roi(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let frame = acquire_one(cam)?;
    files.push(save_frame(
        &frame,
        dir,
        "Image-Full",
        &with_comment(save, "Reference Image"),
    )?);

    let opts = with_comment(save, "Binning Test");
    if supported(cam, Param::BinningY(2))? {
        info!("binning in Y is supported");
        cam.set_binning(1, 2)?;
        let frame = acquire_one(cam)?;
        files.push(save_frame(&frame, dir, "X-1_Y-2_binning", &opts)?);
    }
    for x in [2, 4, 8, 16] {
        if supported(cam, Param::BinningX(x))? {
            info!("binning {x} in X is supported");
            cam.set_binning(x, 1)?;
            let frame = acquire_one(cam)?;
            files.push(save_frame(&frame, dir, &format!("X-{x}_Y-1_binning"), &opts)?);
        }
    }
    cam.set_binning(1, 1)?;

    let (w, h) = cam.max_size()?;
    let roi = set_roi(cam, w / 8, h / 8)?;
    let res = acquire_one(cam).and_then(|frame| {
        info!("acquired an image with a {}x{} region of interest", roi.width, roi.height);
        save_frame(&frame, dir, "Image-ROI", &with_comment(save, "ROI Test"))
    });
    set_roi(cam, w, h)?;
    files.push(res?);
    Ok(files)
}

fn supported(cam: &dyn EmccdCamera, param: Param) -> Result<bool> {
    match cam.param_available(param) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_present() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Settings read back from the camera after [`gains_offsets_temperature`].
#[derive(Clone, Debug, PartialEq)]
pub struct SettingsReport {
    pub detector_temperature: f64,
    pub target_temperature: f64,
    pub calibrated_em_gain: Option<i32>,
    pub raw_em_gain: Option<i32>,
    pub analog_gain: i32,
    pub analog_offset: i32,
}

impl SettingsReport {
    pub fn read(cam: &dyn EmccdCamera) -> Result<Self> {
        let optional = |res: Result<i32>| match res {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_present() => Ok(None),
            Err(e) => Err(e),
        };
        Ok(Self {
            detector_temperature: cam.detector_temperature()?,
            target_temperature: cam.target_temperature()?,
            calibrated_em_gain: optional(cam.calibrated_em_gain())?,
            raw_em_gain: optional(cam.raw_em_gain())?,
            analog_gain: cam.analog_gain()?,
            analog_offset: cam.analog_offset()?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "detector_temperature": self.detector_temperature,
            "target_temperature": self.target_temperature,
            "calibrated_em_gain": self.calibrated_em_gain,
            "raw_em_gain": self.raw_em_gain,
            "analog_gain": self.analog_gain,
            "analog_offset": self.analog_offset,
        })
    }
}

impl fmt::Display for SettingsReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Actual detector temperature: {:.2}", self.detector_temperature)?;
        writeln!(f, "Detector target temperature: {:.2}", self.target_temperature)?;
        if let Some(g) = self.calibrated_em_gain {
            writeln!(f, "Calibrated EM gain: {g}")?;
        }
        if let Some(g) = self.raw_em_gain {
            writeln!(f, "Raw EM gain: {g}")?;
        }
        writeln!(f, "Analog gain: {}", self.analog_gain)?;
        write!(f, "Analog offset: {}", self.analog_offset)
    }
}

/// Saves a reference image, moves the target temperature, EM gain, analog
/// gain and analog offset to the middle of their ranges and saves a second
/// image with the new settings.
#[instrument(skip(cam, save))]
pub fn gains_offsets_temperature(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    save: &SaveOptions,
) -> Result<(SettingsReport, Vec<PathBuf>)> {
    let mut files = Vec::with_capacity(2);
    let frame = acquire_one(cam)?;
    files.push(save_frame(
        &frame,
        dir,
        "ReferenceImage",
        &with_comment(save, "Default settings reference"),
    )?);

    let t = temperature_range(cam)?;
    set_temperature(cam, (t.min + t.max) / 2.0)?;
    set_em_gain(cam, em_gain_median, None)?;
    let g = cam.analog_gain_range()?;
    set_analog_gain(cam, (g.min + g.max) / 2)?;
    let o = cam.analog_offset_range()?;
    set_analog_offset(cam, (o.min + o.max) / 2)?;

    let frame = acquire_one(cam)?;
    files.push(save_frame(
        &frame,
        dir,
        "NewSettingsImage",
        &with_comment(
            save,
            "This is an image grab with the EM gain, analog gain, analog offset and target temperature modified",
        ),
    )?);

    let report = SettingsReport::read(cam)?;
    info!("settings in effect:\n{report}");
    Ok((report, files))
}

/// On-camera processing: bias from a stack of dark images, then an LM image
/// `imageInLM` and a photon counting image `imageInPC`.
#[instrument(skip(cam, save))]
pub fn processing_automatic(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    stack: u32,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    info!("acquiring bias");
    cam.create_bias(stack)?;

    cam.set_proc_type(ProcType::Lm, 0)?;
    let frame = acquire_one(cam)?;
    let lm = save_frame(
        &frame,
        dir,
        "imageInLM",
        &with_comment(save, "This is an image with bias subtraction"),
    )?;

    cam.set_proc_type(ProcType::Pc, PC_AUTO_FRAMES)?;
    cam.set_exposure_time(0.0)?;
    let frame = with_acquisition(cam, 0, |cam| cam.read());
    cam.set_proc_type(ProcType::None, 0)?;
    let pc = save_frame(
        &frame?,
        dir,
        "imageInPC",
        &with_comment(save, "This is an image in photon counting"),
    )?;
    Ok(vec![lm, pc])
}

/// Host processing: a reference image `ncImage`, a bias computed from
/// `stack` dark images, an LM image `ncLmImage` and a photon counting image
/// `ncPcImage` integrated over `pc_frames` images.
#[instrument(skip(cam, save))]
pub fn processing_manual(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    stack: u32,
    pc_frames: u32,
    save: &SaveOptions,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::with_capacity(3);
    let reference = acquire_one(cam)?;
    files.push(save_frame(
        &reference,
        dir,
        "ncImage",
        &with_comment(save, "Not processed reference image"),
    )?);
    info!("reference image acquired");

    let (w, h) = cam.size()?;
    let mut ctx = ProcContext::new(w, h);
    cam.set_shutter_mode(ShutterMode::Close)?;
    let res = cam.start(0).and_then(|_| {
        for i in 0..stack {
            debug!("bias image {}", i + 1);
            ctx.add_bias_image(&cam.read()?)?;
        }
        Ok(())
    });
    let abort = cam.abort();
    res?;
    abort?;
    ctx.compute_bias()?;
    info!("bias calculated, read noise {:.2} ADU", ctx.noise());

    ctx.set_clamp_level(DEFAULT_CLAMP_LEVEL);
    ctx.set_proc_type(ProcType::Lm);
    let mut frame = acquire_one(cam)?;
    ctx.process_in_place(&mut frame)?;
    files.push(save_frame(
        &frame,
        dir,
        "ncLmImage",
        &with_comment(save, "LM-Processed image"),
    )?);
    info!("LM-processed image produced");

    ctx.set_proc_type(ProcType::Pc);
    let timeout = cam.timeout()?;
    cam.set_exposure_time(0.0)?;
    cam.set_timeout(timeout.saturating_mul(pc_frames.max(1) as i32))?;
    let last = with_acquisition(cam, pc_frames, |cam| {
        let mut last = 0;
        for _ in 0..pc_frames {
            let frame = cam.read()?;
            ctx.add_pc_image(&frame)?;
            last = frame.frame_id;
        }
        Ok(last)
    });
    cam.set_timeout(timeout)?;
    let pc: Frame = ctx.take_pc_image(last?);
    files.push(save_frame(
        &pc,
        dir,
        "ncPcImage",
        &with_comment(save, "PC-Processed image"),
    )?);
    info!("PC-processed image produced");
    Ok(files)
}

/// One line of the frame rate comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct SpeedRow {
    pub mode: &'static str,
    pub readout_ms: f64,
    pub acquisition_ms: f64,
    /// Full frame acquisition time over this mode's.
    pub speed_up: f64,
}

#[derive(Clone, Debug, Default)]
pub struct SpeedTable {
    pub rows: Vec<SpeedRow>,
}

impl SpeedTable {
    fn push(&mut self, mode: &'static str, readout_ms: f64, timed: &TimedResult) {
        let acquisition_ms = timed.ms_per_image;
        let speed_up = match self.rows.first() {
            Some(full) if acquisition_ms > 0.0 => full.acquisition_ms / acquisition_ms,
            _ => 1.0,
        };
        self.rows.push(SpeedRow {
            mode,
            readout_ms,
            acquisition_ms,
            speed_up,
        });
    }
}

impl fmt::Display for SpeedTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "Mode\tReadout Time (ms/image)\tAcquisition Time (ms/image)\tReal Speed-up"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<4}\t{:14.3}\t\t{:14.3}\t\t   {:14.3}",
                row.mode, row.readout_ms, row.acquisition_ms, row.speed_up
            )?;
        }
        Ok(())
    }
}

fn log_solutions(solutions: &[CropSolution], padding: i32) {
    if solutions.is_empty() {
        warn!("no crop mode solutions available, standard ROI will be used");
        return;
    }
    let shown = solutions.len().min(CROP_SOLUTIONS_SHOWN);
    info!(
        "{} crop mode solutions with padding {padding}, best {shown}:",
        solutions.len()
    );
    info!("Figure of Merit\t\tX-offset (MIN, MAX)");
    for s in &solutions[..shown] {
        info!(
            "{:7.4}\t\t\t({}, {})",
            s.figure_of_merit, s.offset_x_min, s.offset_x_max
        );
    }
}

fn timed_mode(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    opts: &TimedOptions,
    root: &str,
) -> Result<TimedResult> {
    let opts = TimedOptions {
        root: root.to_owned(),
        ..opts.clone()
    };
    let timed = timed_loop(cam, dir, &opts)?;
    if let Some(dropped) = timed.dropped {
        warn!(
            "over-run occurred ({} times with {dropped} dropped) during the acquisition",
            timed.overruns
        );
    }
    Ok(timed)
}

/// Compares acquisition rates of full frame, maximum binning, a binned ROI
/// an eighth of the sensor and the same ROI in crop mode.
///
/// Exposure and waiting time are zeroed so each mode runs at its readout
/// limit. Binning, ROI and crop mode are left at their defaults on return.
#[instrument(skip(cam, opts))]
pub fn maximize_framerate(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    opts: &TimedOptions,
) -> Result<SpeedTable> {
    let opts = TimedOptions {
        save: opts
            .save
            .as_ref()
            .map(|s| with_comment(s, "This is one of the last 10 images grabbed")),
        ..opts.clone()
    };
    let mut table = SpeedTable::default();

    cam.set_exposure_time(0.0)?;
    cam.set_waiting_time(0.0)?;
    cam.set_readout_mode(1)?;
    let readout = cam.readout_time()?;
    cam.set_timeout(readout as i32 + TIMEOUT_MARGIN_MS)?;
    let timed = timed_mode(cam, dir, &opts, "Image-Full_")?;
    table.push("Full", readout, &timed);

    let res = maximize_reduced(cam, dir, &opts, &mut table);
    let restore = restore_full_frame(cam);
    res?;
    restore?;
    info!("frame rate comparison:\n{table}");
    Ok(table)
}

fn maximize_reduced(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    opts: &TimedOptions,
    table: &mut SpeedTable,
) -> Result<()> {
    let (mut xbin, mut ybin) = (1, 1);
    for n in [2, 4, 8, 16] {
        if supported(cam, Param::BinningX(n))? {
            xbin = n;
        }
        if supported(cam, Param::BinningY(n))? {
            ybin = n;
        }
    }
    if (xbin, ybin) == (1, 1) {
        info!("binning is not supported, skipping the binned tests");
    } else {
        cam.set_binning(xbin, ybin)?;
        info!("binning {xbin}x{ybin}");
        let readout = cam.readout_time()?;
        cam.set_timeout(readout as i32 + TIMEOUT_MARGIN_MS)?;
        let timed = timed_mode(cam, dir, opts, "Image-Bin_")?;
        table.push("Bin", readout, &timed);
    }

    let (w, h) = cam.max_size()?;
    let roi: Roi = set_roi(cam, w / 8, h / 8)?;
    let readout = cam.readout_time()?;
    cam.set_timeout(readout as i32 + TIMEOUT_MARGIN_MS)?;
    let timed = timed_mode(cam, dir, opts, "Image-ROI_")?;
    table.push("ROI", readout, &timed);

    if !supported(cam, Param::CropMode)? {
        info!("crop mode is not supported");
        return Ok(());
    }
    let solutions = cam.crop_solutions(roi.width, roi.height, CropMode::EnableX, 0)?;
    log_solutions(&solutions, 0);
    log_solutions(
        &cam.crop_solutions(roi.width, roi.height, CropMode::EnableX, -1)?,
        -1,
    );
    if solutions.is_empty() {
        return Ok(());
    }

    cam.set_crop_mode(CropMode::EnableX, 0)?;
    let state = cam.crop_mode()?;
    info!(
        "this readout is up to {:.2} times faster than standard ROI above",
        state.figure_of_merit
    );
    let readout = cam.readout_time()?;
    cam.set_timeout(readout as i32 + TIMEOUT_MARGIN_MS)?;
    let timed = timed_mode(cam, dir, opts, "Image-CropMode_")?;
    table.push("Crop", readout, &timed);
    Ok(())
}

fn restore_full_frame(cam: &mut dyn EmccdCamera) -> Result<()> {
    cam.set_crop_mode(CropMode::Disabled, 0)?;
    cam.set_binning(1, 1)?;
    let (w, h) = cam.max_size()?;
    set_roi(cam, w, h)?;
    Ok(())
}
