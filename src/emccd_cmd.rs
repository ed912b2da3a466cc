// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::args::{Backend, EmccdArgs, EmccdCommand};
use std::{
    future::{self, Future},
    path::{Path, PathBuf},
    time::Duration,
};
use tao_camera::{
    acquisition::TimedOptions,
    display::{self, DisplayConfig, JpegSink},
    emccd::{self, programs, EmccdCamera, ShutterMode},
    error::{Error, Result},
    save::SaveOptions,
    sim::SimEmccd,
};
use tracing::{info, warn};

fn open(args: &EmccdArgs, backend: Backend) -> Result<Box<dyn EmccdCamera>> {
    let cam = match backend {
        Backend::Sim => SimEmccd::open(args.unit, args.channel, args.loop_buffers)?,
        Backend::SimFast => SimEmccd::builder().loop_buffers(args.loop_buffers).build(),
    };
    info!(
        "camera opened on unit {} channel {} with {} loop buffers",
        args.unit, args.channel, args.loop_buffers
    );
    Ok(Box::new(cam))
}

/// Applies the temperature and EM gain requested on the command line.
fn apply_settings(cam: &mut dyn EmccdCamera, args: &EmccdArgs) -> Result<()> {
    if let Some(celsius) = args.temperature {
        emccd::set_temperature(cam, celsius)?;
    }
    if emccd::set_em_gain(cam, emccd::em_gain_requested, args.em_gain)?.is_none() {
        info!("EM gain unchanged");
    }
    Ok(())
}

fn program(
    cam: &mut dyn EmccdCamera,
    command: &EmccdCommand,
    dir: &Path,
    save: &SaveOptions,
) -> Result<()> {
    match command {
        EmccdCommand::Continuous { images } => {
            let files = programs::continuous(cam, dir, *images, save)?;
            info!("{} image(s) saved", files.len());
        }
        EmccdCommand::Timed { images } => {
            for (path, ms) in programs::timed(cam, dir, *images, save)? {
                println!("{}\t{ms:.3} ms", path.display());
            }
        }
        EmccdCommand::Timestamp { images } => {
            let report = programs::internal_timestamp(cam, dir, *images, save)?;
            for (i, ts) in report.timestamps.iter().enumerate() {
                println!("{i}\t{ts}");
            }
            if report.dropped > 0 {
                println!("{} image(s) lost", report.dropped);
            }
        }
        EmccdCommand::Callback => {
            let path = programs::callback(cam, dir, save)?;
            println!("{}", path.display());
        }
        EmccdCommand::TemperatureHeader => {
            let path = programs::save_with_temperature(cam, dir)?;
            println!("{}", path.display());
        }
        EmccdCommand::Cubes { images, depth } => {
            for path in programs::data_cubes(cam, dir, *images, *depth, save)? {
                println!("{}", path.display());
            }
        }
        EmccdCommand::ReadoutModes => {
            let files = programs::readout_modes(cam, dir, save)?;
            info!("{} image(s) saved", files.len());
        }
        EmccdCommand::BinRoi => {
            let files = programs::bin_and_roi(cam, dir, save)?;
            info!("{} image(s) saved", files.len());
        }
        EmccdCommand::Gains { json } => {
            let (report, _) = programs::gains_offsets_temperature(cam, dir, save)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            } else {
                println!("{report}");
            }
        }
        EmccdCommand::Processing {
            manual,
            stack,
            pc_frames,
        } => {
            let files = if *manual {
                programs::processing_manual(cam, dir, *stack, *pc_frames, save)?
            } else {
                programs::processing_automatic(cam, dir, *stack, save)?
            };
            info!("{} image(s) saved", files.len());
        }
        EmccdCommand::Maximize { images, warmup } => {
            let opts = TimedOptions {
                images: *images,
                warmup: *warmup,
                save: Some(save.clone()),
                ..TimedOptions::default()
            };
            let table = programs::maximize_framerate(cam, dir, &opts)?;
            print!("{table}");
        }
        EmccdCommand::Display { .. } => {
            return Err(Error::InvalidArgument(
                "display runs on the async runtime".to_owned(),
            ))
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C, or after `duration` seconds when given.
fn shutdown_signal(duration: Option<u64>) -> impl Future<Output = ()> {
    async move {
        let timer = async {
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => future::pending().await,
            }
        };
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {e}");
                future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = interrupt => info!("interrupted"),
            _ = timer => info!("display duration elapsed"),
        }
    }
}

pub async fn run(
    args: EmccdArgs,
    backend: Backend,
    dir: PathBuf,
    save: SaveOptions,
) -> Result<()> {
    let mut cam = open(&args, backend)?;

    if let EmccdCommand::Display {
        rotate,
        conversion,
        refresh_ms,
        preview,
        duration,
    } = &args.command
    {
        let roi = display::initialize(cam.as_mut(), args.exposure_ms)?;
        apply_settings(cam.as_mut(), &args)?;
        info!("displaying region {roi}");
        let cfg = DisplayConfig {
            conversion: (*conversion).into(),
            rotation: *rotate,
            refresh: Duration::from_millis(*refresh_ms),
            ..DisplayConfig::default()
        };
        let preview = dir.join(preview);
        info!("preview written to {}", preview.display());
        let sink = Box::new(JpegSink::new(preview, save.quality));
        let stats = display::run(cam, cfg, sink, shutdown_signal(*duration)).await?;
        println!(
            "{} frames published, {} displayed",
            stats.published, stats.updates
        );
        return Ok(());
    }

    tokio::task::spawn_blocking(move || {
        let res = emccd::initialize(cam.as_mut(), args.exposure_ms)
            .and_then(|_| apply_settings(cam.as_mut(), &args))
            .and_then(|_| program(cam.as_mut(), &args.command, &dir, &save));
        let abort = cam.abort();
        let close = cam.set_shutter_mode(ShutterMode::Close);
        res?;
        abort?;
        close
    })
    .await
    .map_err(|_| Error::ThreadPanic("program"))?
}
