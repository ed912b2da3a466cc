// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Live display: the acquisition thread publishes into a
//! [`SharedFrameBuffer`], a polling loop copies it into a [`Surface`] and
//! hands the surface to a [`Sink`].

use crate::{
    acquisition::{lock_camera, share, Producer, SharedCamera},
    buffer::SharedFrameBuffer,
    emccd::{self, EmccdCamera, Roi, ShutterMode},
    error::{Error, Result},
    image::{encode_jpeg, Conversion, Format, Image, Rotation},
};
use std::{
    fs,
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Size of the displayed region of interest.
pub const DISPLAY_WIDTH: u32 = 128;
pub const DISPLAY_HEIGHT: u32 = 128;
pub const REFRESH_PERIOD: Duration = Duration::from_millis(40);
pub const STATUS_PERIOD: Duration = Duration::from_secs(5);
/// Exposure used when none is requested.
pub const DEFAULT_EXPOSURE_MS: f64 = 100.0;

/// Prepares the camera for live display: standard timing for `exposure_ms`
/// (100 ms when absent), a centred display-sized ROI and the lowest analog
/// gain.
pub fn initialize(cam: &mut dyn EmccdCamera, exposure_ms: Option<f64>) -> Result<Roi> {
    emccd::initialize(cam, Some(exposure_ms.unwrap_or(DEFAULT_EXPOSURE_MS)))?;
    let roi = emccd::set_roi(cam, DISPLAY_WIDTH, DISPLAY_HEIGHT)?;
    emccd::set_analog_gain(cam, 0)?;
    Ok(roi)
}

/// Paintable copy of the shared buffer with the display rotation applied.
pub struct Surface {
    frame: Image,
    rotated: Image,
    rotation: Rotation,
    seen: u64,
    updates: u64,
    repaints: u64,
}

impl Surface {
    pub fn new(width: u32, height: u32, format: Format, rotation: Rotation) -> Self {
        let frame = Image::new(width, height, format);
        let rotated = frame.rotate(rotation);
        Self {
            frame,
            rotated,
            rotation,
            seen: 0,
            updates: 0,
            repaints: 0,
        }
    }

    /// Copies the buffer when it holds a newer frame. Returns true when the
    /// surface changed; stale data is kept and repainted otherwise.
    pub fn refresh(&mut self, buffer: &SharedFrameBuffer) -> Result<bool> {
        let generation = buffer.copy_if_newer(&mut self.frame, self.seen)?;
        self.repaints += 1;
        if generation == self.seen {
            return Ok(false);
        }
        self.seen = generation;
        self.rotated = self.frame.rotate(self.rotation);
        self.updates += 1;
        Ok(true)
    }

    pub fn image(&self) -> &Image {
        &self.rotated
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn repaints(&self) -> u64 {
        self.repaints
    }
}

/// Receives the surface after every refresh that brought a new frame.
pub trait Sink: Send {
    fn draw(&mut self, image: &Image) -> Result<()>;
}

/// Writes the latest surface as a JPEG file, replacing it atomically.
pub struct JpegSink {
    path: PathBuf,
    quality: i32,
}

impl JpegSink {
    pub fn new(path: PathBuf, quality: i32) -> Self {
        Self { path, quality }
    }
}

impl Sink for JpegSink {
    fn draw(&mut self, image: &Image) -> Result<()> {
        let jpeg = encode_jpeg(image, self.quality)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &jpeg[..])?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub conversion: Conversion,
    pub rotation: Rotation,
    pub refresh: Duration,
    pub status: Duration,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            conversion: Conversion::Gray8,
            rotation: Rotation::default(),
            refresh: REFRESH_PERIOD,
            status: STATUS_PERIOD,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayStats {
    /// Frames published by the acquisition thread.
    pub published: u64,
    /// Refreshes that picked up a new frame.
    pub updates: u64,
    pub repaints: u64,
}

fn spawn_status(cam: SharedCamera, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let cam = cam.clone();
            let status = tokio::task::spawn_blocking(move || -> Result<(f64, f64)> {
                let cam = lock_camera(&cam);
                Ok((cam.detector_temperature()?, cam.framerate()?))
            })
            .await;
            match status {
                Ok(Ok((temperature, fps))) => {
                    info!("detector temperature {temperature:.2} C, {fps:.1} fps")
                }
                Ok(Err(e)) => warn!("status poll failed: {e}"),
                Err(_) => return,
            }
        }
    })
}

/// Runs the live display until `shutdown` resolves or the acquisition
/// thread stops, then joins the thread, aborts the acquisition and closes
/// the shutter before dropping the camera.
#[instrument(skip_all)]
pub async fn run(
    cam: Box<dyn EmccdCamera>,
    cfg: DisplayConfig,
    mut sink: Box<dyn Sink>,
    shutdown: impl Future<Output = ()>,
) -> Result<DisplayStats> {
    if cfg.refresh.is_zero() || cfg.status.is_zero() {
        return Err(Error::InvalidArgument(format!(
            "display periods must be non-zero (refresh {:?}, status {:?})",
            cfg.refresh, cfg.status
        )));
    }
    let (width, height) = cam.size()?;
    let format = cfg.conversion.format();
    let cam = share(cam);
    let buffer = Arc::new(SharedFrameBuffer::new(width, height, format));
    let producer = Producer::spawn(cam.clone(), buffer.clone(), cfg.conversion)?;
    let status = spawn_status(cam.clone(), cfg.status);
    info!(
        "display {width}x{height} {format} rotated {} degrees",
        cfg.rotation.degrees()
    );

    let mut surface = Surface::new(width, height, format, cfg.rotation);
    let mut refresh = tokio::time::interval(cfg.refresh);
    tokio::pin!(shutdown);
    let res = loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("display shutdown requested");
                break Ok(());
            }
            _ = refresh.tick() => {
                match surface.refresh(&buffer) {
                    Ok(true) => {
                        if let Err(e) = sink.draw(surface.image()) {
                            break Err(e);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
                if producer.is_finished() {
                    break Ok(());
                }
            }
        }
    };
    status.abort();

    let published = tokio::task::spawn_blocking(move || producer.stop())
        .await
        .map_err(|_| Error::ThreadPanic("producer"))?;
    {
        let mut cam = lock_camera(&cam);
        cam.abort()?;
        cam.set_shutter_mode(ShutterMode::Close)?;
    }
    drop(cam);
    res?;

    let stats = DisplayStats {
        published: published?,
        updates: surface.updates(),
        repaints: surface.repaints(),
    };
    info!(
        "display stopped: {} published {} updates {} repaints",
        stats.published, stats.updates, stats.repaints
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Pixels};

    #[test]
    fn surface_repaints_stale_data() {
        let buffer = SharedFrameBuffer::new(2, 3, Format::Gray8);
        let mut surface = Surface::new(2, 3, Format::Gray8, Rotation::Rotation90);
        assert_eq!(surface.image().width(), 3);
        assert!(!surface.refresh(&buffer).unwrap());

        let frame = Frame::new(2, 3, Pixels::U16(vec![u16::MAX; 6]), 0);
        buffer.publish(&frame, Conversion::Gray8).unwrap();
        assert!(surface.refresh(&buffer).unwrap());
        assert!(!surface.refresh(&buffer).unwrap());
        assert_eq!(surface.updates(), 1);
        assert_eq!(surface.repaints(), 3);
        assert_eq!(surface.image().pixel(2, 1), 254);
    }
}
