// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::args::{AcquireArgs, FormatArgs, GenicamArgs, GenicamCommand, Mode, NamingArg};
use std::{path::Path, time::Duration};
use tao_camera::{
    error::Result,
    genicam::{
        self, features_to_json, nodes, AcquireOptions, AcquisitionMode, Camera, Feature,
        ImageFormatConfig, Naming, NodeMapExt, System,
    },
    save::SaveOptions,
    sim::SimSystem,
};
use tracing::info;

fn acquire_options(args: &AcquireArgs, save: &SaveOptions) -> AcquireOptions {
    AcquireOptions {
        mode: match args.mode {
            Mode::Single => AcquisitionMode::SingleFrame,
            Mode::Continuous => AcquisitionMode::Continuous,
        },
        count: args.images,
        frame_rate: args.frame_rate,
        timeout: Duration::from_millis(args.timeout_ms),
        naming: match args.naming {
            NamingArg::Sequence => Naming::Sequence,
            NamingArg::Serial => Naming::Serial,
        },
        save: save.clone(),
    }
}

fn format_config(args: &FormatArgs) -> ImageFormatConfig {
    ImageFormatConfig {
        pixel_format: args.pixel_format.clone(),
        pixel_coding: args.pixel_coding.clone(),
        width: args.width,
        height: args.height,
        offset_x: args.offset_x,
        offset_y: args.offset_y,
        reverse_x: args.reverse_x,
    }
}

fn print_features(features: &[Feature], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&features_to_json(features))?);
    } else {
        for feature in features {
            println!("{feature}");
        }
    }
    Ok(())
}

/// Runs `body` on an initialized camera and deinitializes it afterwards,
/// whatever the outcome.
fn with_initialized<T>(
    camera: &mut dyn Camera,
    body: impl FnOnce(&mut dyn Camera) -> Result<T>,
) -> Result<T> {
    camera.init()?;
    let res = body(&mut *camera);
    let deinit = camera.deinit();
    let value = res?;
    deinit?;
    Ok(value)
}

fn log_saved(files: &[std::path::PathBuf]) {
    info!("{} image(s) saved", files.len());
}

pub fn run(args: &GenicamArgs, dir: &Path, save: &SaveOptions) -> Result<()> {
    let system = SimSystem::instance();
    system.set_camera_count(args.sim_cameras);
    info!("library version {}", system.version());

    match &args.command {
        GenicamCommand::Info { json } => {
            for iface in system.interfaces()? {
                info!("interface {}: {} camera(s)", iface.name, iface.cameras);
            }
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            let features = camera.tl_device_node_map().dump_category(nodes::ROOT)?;
            print_features(&features, *json)
        }
        GenicamCommand::StreamInfo { json } => {
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            let features = camera.tl_stream_node_map().dump_category(nodes::ROOT)?;
            print_features(&features, *json)
        }
        GenicamCommand::Check => genicam::check_camera(system.as_ref(), args.camera),
        GenicamCommand::Acquire(acquire) => {
            let opts = acquire_options(acquire, save);
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            let files = with_initialized(camera.as_mut(), |cam| {
                genicam::acquire_images(cam, &opts, dir)
            })?;
            log_saved(&files);
            Ok(())
        }
        GenicamCommand::Exposure {
            exposure_us,
            acquire,
        } => {
            let opts = acquire_options(acquire, save);
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            let files = with_initialized(camera.as_mut(), |cam| {
                genicam::configure_exposure(cam.node_map()?, *exposure_us)?;
                let res = genicam::acquire_images(cam, &opts, dir);
                let reset = genicam::reset_exposure(cam.node_map()?);
                let files = res?;
                reset?;
                Ok(files)
            })?;
            log_saved(&files);
            Ok(())
        }
        GenicamCommand::Roi { format, acquire } => {
            let cfg = format_config(format);
            let opts = acquire_options(acquire, save);
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            let files = with_initialized(camera.as_mut(), |cam| {
                let applied = genicam::configure_image_format(cam.node_map()?, &cfg)?;
                info!("applied format {applied:?}");
                let features = cam
                    .node_map()?
                    .dump_category(nodes::IMAGE_FORMAT_CONTROL)?;
                print_features(&features, false)?;
                genicam::acquire_images(cam, &opts, dir)
            })?;
            log_saved(&files);
            Ok(())
        }
        GenicamCommand::Reset => {
            let mut camera = genicam::select_camera(system.as_ref(), args.camera)?;
            with_initialized(camera.as_mut(), |cam| genicam::device_reset(cam.node_map()?))
        }
    }
}
