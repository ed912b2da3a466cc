// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Acquisition loops shared by the EMCCD programs and the live display.

use crate::{
    buffer::SharedFrameBuffer,
    emccd::{EmccdCamera, Param, ShutterMode, TimestampMode},
    error::{Error, Result},
    frame::Frame,
    image::Conversion,
    save::{self, SaveOptions},
};
use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, info_span, instrument, trace, warn};

/// Camera shared between the producer thread and the status poller.
pub type SharedCamera = Arc<Mutex<Box<dyn EmccdCamera>>>;

pub fn share(cam: Box<dyn EmccdCamera>) -> SharedCamera {
    Arc::new(Mutex::new(cam))
}

pub fn lock_camera(cam: &SharedCamera) -> MutexGuard<'_, Box<dyn EmccdCamera>> {
    cam.lock().unwrap_or_else(|e| e.into_inner())
}

/// Rolling average of the instantaneous frame rate.
pub struct FpsCounter {
    prev: Instant,
    history: Vec<i64>,
    index: usize,
}

impl FpsCounter {
    pub fn new(window: usize) -> Self {
        Self {
            prev: Instant::now(),
            history: vec![0; window.max(1)],
            index: 0,
        }
    }

    pub fn update(&mut self) -> i64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.prev);
        self.prev = now;

        self.history[self.index] = 1e9 as i64 / (elapsed.as_nanos() as i64).max(1);
        self.index = (self.index + 1) % self.history.len();

        (self.history.iter().sum::<i64>() as f64 / self.history.len() as f64).round() as i64
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(30)
    }
}

fn frame_mark() {
    if let Some(client) = tracy_client::Client::running() {
        client.frame_mark();
    }
}

/// Handle on the acquisition thread feeding a [`SharedFrameBuffer`].
///
/// The thread opens the shutter, then arms, triggers and reads one image per
/// iteration and publishes it. [`Producer::stop`] signals the done channel
/// and joins; the shutter is closed on every exit path.
pub struct Producer {
    done: kanal::Sender<()>,
    handle: JoinHandle<Result<u64>>,
}

impl Producer {
    pub fn spawn(
        cam: SharedCamera,
        buffer: Arc<SharedFrameBuffer>,
        conv: Conversion,
    ) -> Result<Self> {
        let (done, done_rx) = kanal::bounded(1);
        let handle = thread::Builder::new()
            .name("producer".to_owned())
            .spawn(move || produce(&cam, &buffer, conv, &done_rx))?;
        Ok(Self { done, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the thread and returns the number of frames it published.
    pub fn stop(self) -> Result<u64> {
        if self.done.try_send(()).is_err() {
            debug!("producer already exited");
        }
        self.handle
            .join()
            .map_err(|_| Error::ThreadPanic("producer"))?
    }
}

fn produce(
    cam: &SharedCamera,
    buffer: &SharedFrameBuffer,
    conv: Conversion,
    done: &kanal::Receiver<()>,
) -> Result<u64> {
    lock_camera(cam).set_shutter_mode(ShutterMode::Open)?;
    let res = produce_loop(cam, buffer, conv, done);
    let close = lock_camera(cam).set_shutter_mode(ShutterMode::Close);
    match &res {
        Ok(n) => info!("producer stopped after {n} frames"),
        Err(e) => error!("producer failed: {e}"),
    }
    let n = res?;
    close?;
    Ok(n)
}

fn produce_loop(
    cam: &SharedCamera,
    buffer: &SharedFrameBuffer,
    conv: Conversion,
    done: &kanal::Receiver<()>,
) -> Result<u64> {
    let mut fps = FpsCounter::default();
    let mut published = 0;
    loop {
        match done.try_recv() {
            Ok(None) => {}
            // signalled, or the owner went away
            Ok(Some(())) | Err(_) => return Ok(published),
        }

        let frame = {
            let _span = info_span!("read").entered();
            let mut cam = lock_camera(cam);
            cam.prepare_acquisition(1)?;
            cam.begin_acquisition()?;
            cam.read()?
        };
        let generation = buffer.publish(&frame, conv)?;
        published += 1;
        frame_mark();
        trace!("published {frame} generation {generation} fps {}", fps.update());
    }
}

/// Writes frames handed over by an acquisition loop on a separate thread.
///
/// The queue is bounded: when the writer falls behind, [`Saver::submit`]
/// waits for room so every frame reaches disk in submission order.
pub struct Saver {
    tx: kanal::Sender<(Frame, String)>,
    handle: JoinHandle<Result<usize>>,
}

impl Saver {
    pub fn spawn(dir: &Path, opts: SaveOptions, depth: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let dir = dir.to_path_buf();
        let (tx, rx) = kanal::bounded::<(Frame, String)>(depth.max(1));
        let handle = thread::Builder::new()
            .name("saver".to_owned())
            .spawn(move || -> Result<usize> {
                let mut saved = 0;
                while let Ok((frame, name)) = rx.recv() {
                    save::save_frame(&frame, &dir, &name, &opts)?;
                    saved += 1;
                }
                Ok(saved)
            })?;
        Ok(Self { tx, handle })
    }

    /// Queues a frame, waiting while the queue is full. Fails when the
    /// writer thread has stopped.
    pub fn submit(&self, frame: Frame, name: String) -> Result<()> {
        if self.tx.send((frame, name)).is_err() {
            warn!("saver stopped");
            return Err(Error::ThreadStopped("saver"));
        }
        Ok(())
    }

    /// Flushes the queue and returns the number of files written.
    pub fn finish(self) -> Result<usize> {
        drop(self.tx);
        self.handle.join().map_err(|_| Error::ThreadPanic("saver"))?
    }
}

/// Time base of a [`timed_loop`] measurement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Clock {
    /// Timestamps stamped by the camera controller.
    Controller,
    /// Host timestamps since the last timer reset.
    Host,
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Clock::Controller => f.write_str("controller"),
            Clock::Host => f.write_str("host"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimedOptions {
    /// Images timed after the warm-up.
    pub images: u32,
    /// Images read and discarded before timing starts.
    pub warmup: u32,
    /// File name root; images are saved as `<root><n>` with n cycling 0-9.
    pub root: String,
    pub save: Option<SaveOptions>,
}

impl Default for TimedOptions {
    fn default() -> Self {
        Self {
            images: 1000,
            warmup: 10,
            root: "Image_".to_owned(),
            save: Some(SaveOptions::default()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimedResult {
    pub images: u32,
    pub total_ms: f64,
    pub ms_per_image: f64,
    pub overruns: u32,
    /// Images the camera dropped; only queried when overruns occurred.
    pub dropped: Option<u32>,
    pub clock: Clock,
    /// Files written; names cycle so at most ten remain on disk.
    pub saved: usize,
}

/// Name of the file written for image `index` of a timed loop.
pub fn cycle_name(root: &str, index: i64) -> String {
    format!("{root}{}", index.unsigned_abs() % 10)
}

/// Acquires `warmup + images + 1` images continuously and measures the
/// acquisition time of `images` of them.
///
/// Images are indexed from `-warmup` to `images`; the start time is taken
/// at index 0 and the stop time at `images`. Controller timestamps are used
/// when the camera has them, with a permanent switch to host timestamps at
/// the first image that lacks one.
#[instrument(skip(cam, opts), fields(images = opts.images, warmup = opts.warmup))]
pub fn timed_loop(
    cam: &mut dyn EmccdCamera,
    dir: &Path,
    opts: &TimedOptions,
) -> Result<TimedResult> {
    if opts.images == 0 {
        return Err(Error::InvalidArgument("timed loop needs images".to_owned()));
    }

    let mut clock = match cam.param_available(Param::CtrlTimestamp) {
        Ok(()) => {
            cam.set_timestamp_mode(TimestampMode::Internal)?;
            Clock::Controller
        }
        Err(e) if e.is_not_present() => Clock::Host,
        Err(e) => return Err(e),
    };
    cam.reset_timer(0.0)?;

    let saver = match &opts.save {
        Some(save) => Some(Saver::spawn(dir, save.clone(), 16)?),
        None => None,
    };

    cam.set_shutter_mode(ShutterMode::Open)?;
    let res = cam
        .start(0)
        .and_then(|_| timed_reads(cam, opts, &mut clock, saver.as_ref()));
    let abort = cam.abort();
    let close = cam.set_shutter_mode(ShutterMode::Close);
    let saved = saver.map(Saver::finish).transpose();
    let (total_ms, overruns) = match res {
        // The writer's own error explains why it stopped.
        Err(e @ Error::ThreadStopped(_)) => {
            saved?;
            return Err(e);
        }
        res => res?,
    };
    abort?;
    close?;
    let saved = saved?.unwrap_or(0);

    let dropped = if overruns > 0 {
        Some(cam.dropped_images()?)
    } else {
        None
    };
    let result = TimedResult {
        images: opts.images,
        total_ms,
        ms_per_image: total_ms / f64::from(opts.images),
        overruns,
        dropped,
        clock,
        saved,
    };
    info!(
        "{} images in {:.3} ms ({:.3} ms/image, {} clock), {} overruns",
        result.images, result.total_ms, result.ms_per_image, result.clock, result.overruns
    );
    Ok(result)
}

fn timed_reads(
    cam: &mut dyn EmccdCamera,
    opts: &TimedOptions,
    clock: &mut Clock,
    saver: Option<&Saver>,
) -> Result<(f64, u32)> {
    let last = i64::from(opts.images);
    let mut ctrl_start = None;
    let mut host_start = 0.0;
    let mut total = 0.0;
    let mut overruns = 0;

    for i in -i64::from(opts.warmup)..=last {
        let frame = cam.read()?;
        if cam.overrun()? {
            overruns += 1;
            trace!("overrun at image {i}");
        }

        if i == 0 || i == last {
            let host = cam.host_timestamp(&frame)?;
            let ctrl = match *clock {
                Clock::Controller => match cam.ctrl_timestamp(&frame) {
                    Ok(ts) => Some(ts.as_ms()),
                    Err(Error::NoTimestamp) => {
                        warn!("image {i} has no controller timestamp, using host time");
                        *clock = Clock::Host;
                        None
                    }
                    Err(e) => return Err(e),
                },
                Clock::Host => None,
            };
            if i == 0 {
                host_start = host;
                ctrl_start = ctrl;
            }
            if i == last {
                total = match (ctrl_start, ctrl) {
                    (Some(start), Some(stop)) => stop - start,
                    _ => host - host_start,
                };
            }
        } else if *clock == Clock::Controller {
            // A missing timestamp anywhere disables the controller clock.
            if let Err(Error::NoTimestamp) = cam.ctrl_timestamp(&frame) {
                warn!("image {i} has no controller timestamp, using host time");
                *clock = Clock::Host;
            }
        }

        if let Some(saver) = saver {
            saver.submit(frame, cycle_name(&opts.root, i))?;
        }
    }
    Ok((total, overruns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_names_wrap_on_absolute_index() {
        assert_eq!(cycle_name("Image-Full_", -10), "Image-Full_0");
        assert_eq!(cycle_name("Image-Full_", -3), "Image-Full_3");
        assert_eq!(cycle_name("Image-Full_", 1000), "Image-Full_0");
        assert_eq!(cycle_name("Image-Full_", 17), "Image-Full_7");
    }

    #[test]
    fn fps_counter_is_positive() {
        let mut fps = FpsCounter::new(2);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(fps.update() > 0);
    }
}
