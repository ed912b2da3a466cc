// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::{Args, Command};
use clap::Parser;
use std::{error::Error, fs, process::ExitCode};
use tao_camera::{
    error::{report, Status},
    save::SaveOptions,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

mod args;
mod emccd_cmd;
mod genicam_cmd;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let console = args.tokio_console.then(console_subscriber::spawn);
    let journald = match tracing_journald::layer() {
        Ok(layer) => Some(layer.with_filter(level)),
        Err(_) => None,
    };
    let tracy = args.tracy.then(|| {
        tracy_client::Client::start();
        tracing_tracy::TracyLayer::default()
    });

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(tracing_subscriber::fmt::layer().with_filter(level))
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;
    info!("TAO camera tools {}", env!("CARGO_PKG_VERSION"));

    fs::create_dir_all(&args.output)?;
    let save = SaveOptions {
        format: args.image_format(),
        overwrite: !args.no_overwrite,
        quality: args.quality,
        ..SaveOptions::default()
    };

    let res = match args.command {
        Command::Genicam(cmd) => report("genicam", genicam_cmd::run(&cmd, &args.output, &save)),
        Command::Emccd(cmd) => report(
            "emccd",
            emccd_cmd::run(cmd, args.backend, args.output.clone(), save).await,
        ),
    };
    let status = Status::from(&res);
    if !status.is_ok() {
        warn!("finished with errors");
    }
    Ok(ExitCode::from(status.exit_code()))
}
