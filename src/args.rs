// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tao_camera::{
    emccd::{
        programs::{BIAS_STACK, CUBE_DEPTH, PC_FRAMES},
        AUTO_CHANNEL, AUTO_UNIT, DEFAULT_LOOP_BUFFERS,
    },
    image::{Conversion, Rotation},
    save::ImageFormat,
};

/// Camera implementation to drive.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Backend {
    /// Simulated cameras paced at their real frame rate
    Sim,
    /// Simulated cameras on a virtual clock, as fast as the host allows
    SimFast,
}

/// Saved image file format.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum SaveFormat {
    /// FITS primary image
    Fits,
    /// Baseline JPEG, 8-bit gray
    Jpeg,
}

impl From<SaveFormat> for ImageFormat {
    fn from(f: SaveFormat) -> Self {
        match f {
            SaveFormat::Fits => ImageFormat::Fits,
            SaveFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// GenICam acquisition mode.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Mode {
    /// Acquire a single image
    Single,
    /// Acquire images continuously
    Continuous,
}

/// Naming of images saved by GenICam acquisitions.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum NamingArg {
    /// Sequence index
    Sequence,
    /// Device serial number and index
    Serial,
}

/// 16-bit to display conversion.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum ConversionArg {
    /// 8-bit gray
    Gray8,
    /// Inverted 8-bit gray
    Inverted,
    /// 10-bit gray replicated in three channels
    Rgb30,
}

impl From<ConversionArg> for Conversion {
    fn from(c: ConversionArg) -> Self {
        match c {
            ConversionArg::Gray8 => Conversion::Gray8,
            ConversionArg::Inverted => Conversion::Gray8Inverted,
            ConversionArg::Rgb30 => Conversion::Rgb30,
        }
    }
}

fn parse_rotation(s: &str) -> Result<Rotation, String> {
    let degrees: i32 = s.parse().map_err(|e| format!("{e}"))?;
    Rotation::from_degrees(degrees).map_err(|e| e.to_string())
}

/// Command-line arguments for the TAO camera tools.
///
/// Every option can also be given through the environment variable named
/// next to it.
///
/// # Example
///
/// ```bash
/// # Via command line
/// tao-camera --output /tmp/images emccd continuous --images 10
///
/// # Via environment variables
/// export OUTPUT_DIR=/tmp/images
/// export IMAGES=10
/// tao-camera emccd continuous
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera implementation
    #[arg(long, env = "BACKEND", default_value = "sim", value_enum)]
    pub backend: Backend,

    /// Directory receiving saved images
    #[arg(short, long, env = "OUTPUT_DIR", default_value = ".")]
    pub output: PathBuf,

    /// File format of saved images [default: jpeg for genicam, fits for emccd]
    #[arg(long, env = "IMAGE_FORMAT", value_enum)]
    pub format: Option<SaveFormat>,

    /// Fail instead of replacing existing files
    #[arg(long, env = "NO_OVERWRITE")]
    pub no_overwrite: bool,

    /// JPEG quality
    #[arg(long, env = "JPEG_QUALITY", default_value = "100",
          value_parser = clap::value_parser!(i32).range(1..=100))]
    pub quality: i32,

    /// Enable verbose debug logging
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// GenICam machine-vision cameras
    Genicam(GenicamArgs),
    /// Low-light EMCCD cameras
    Emccd(EmccdArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct GenicamArgs {
    /// Index of the camera to operate
    #[arg(short, long, env = "CAMERA_INDEX", default_value = "0")]
    pub camera: usize,

    /// Number of simulated cameras attached
    #[arg(long, env = "SIM_CAMERAS", default_value = "1")]
    pub sim_cameras: usize,

    #[command(subcommand)]
    pub command: GenicamCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum GenicamCommand {
    /// List interfaces and cameras and dump the device information
    Info {
        /// Print the dump as JSON
        #[arg(long, env = "JSON")]
        json: bool,
    },
    /// Dump the transport stream information of the camera
    StreamInfo {
        /// Print the dump as JSON
        #[arg(long, env = "JSON")]
        json: bool,
    },
    /// Check that the camera accepts continuous acquisition
    Check,
    /// Acquire and save images
    Acquire(AcquireArgs),
    /// Acquire with a fixed exposure time, then restore automatic exposure
    Exposure {
        /// Exposure time in microseconds, capped to the camera maximum
        #[arg(short, long, env = "EXPOSURE_US", default_value = "2000000")]
        exposure_us: f64,

        #[command(flatten)]
        acquire: AcquireArgs,
    },
    /// Configure pixel format, region of interest and mirroring, then acquire
    Roi {
        #[command(flatten)]
        format: FormatArgs,

        #[command(flatten)]
        acquire: AcquireArgs,
    },
    /// Reset the device
    Reset,
}

#[derive(Parser, Debug, Clone)]
pub struct AcquireArgs {
    /// Acquisition mode
    #[arg(short, long, env = "MODE", default_value = "continuous", value_enum)]
    pub mode: Mode,

    /// Images to acquire in continuous mode
    #[arg(short = 'n', long, env = "IMAGES", default_value = "10")]
    pub images: usize,

    /// Frame rate limit
    #[arg(long, env = "FRAME_RATE")]
    pub frame_rate: Option<f64>,

    /// Timeout waiting for each image, in milliseconds
    #[arg(long, env = "TIMEOUT_MS", default_value = "1000")]
    pub timeout_ms: u64,

    /// Image file naming
    #[arg(long, env = "NAMING", default_value = "sequence", value_enum)]
    pub naming: NamingArg,
}

#[derive(Parser, Debug, Clone)]
pub struct FormatArgs {
    /// Pixel format symbolic name (e.g. Mono8, Mono16)
    #[arg(long, env = "PIXEL_FORMAT")]
    pub pixel_format: Option<String>,

    /// Pixel coding symbolic name
    #[arg(long, env = "PIXEL_CODING")]
    pub pixel_coding: Option<String>,

    /// ROI width, capped to the sensor
    #[arg(long, env = "ROI_WIDTH")]
    pub width: Option<i64>,

    /// ROI height, capped to the sensor
    #[arg(long, env = "ROI_HEIGHT")]
    pub height: Option<i64>,

    /// ROI horizontal offset
    #[arg(long, env = "OFFSET_X")]
    pub offset_x: Option<i64>,

    /// ROI vertical offset
    #[arg(long, env = "OFFSET_Y")]
    pub offset_y: Option<i64>,

    /// Mirror the image horizontally
    #[arg(long, env = "REVERSE_X")]
    pub reverse_x: Option<bool>,
}

#[derive(Parser, Debug, Clone)]
pub struct EmccdArgs {
    /// Acquisition unit, -1 for the first found
    #[arg(long, env = "UNIT", default_value_t = AUTO_UNIT, allow_negative_numbers = true)]
    pub unit: i32,

    /// Channel of the unit, -1 for the first found
    #[arg(long, env = "CHANNEL", default_value_t = AUTO_CHANNEL, allow_negative_numbers = true)]
    pub channel: i32,

    /// Loop buffers used for continuous acquisition
    #[arg(long, env = "LOOP_BUFFERS", default_value_t = DEFAULT_LOOP_BUFFERS)]
    pub loop_buffers: u32,

    /// Exposure time in milliseconds, defaults to the readout time
    #[arg(short, long, env = "EXPOSURE_MS")]
    pub exposure_ms: Option<f64>,

    /// EM gain, clamped to the camera range; the median when absent
    #[arg(long, env = "EM_GAIN")]
    pub em_gain: Option<i32>,

    /// Detector target temperature in Celsius
    #[arg(short, long, env = "TEMPERATURE", allow_negative_numbers = true)]
    pub temperature: Option<f64>,

    #[command(subcommand)]
    pub command: EmccdCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum EmccdCommand {
    /// Acquire images continuously
    Continuous {
        #[arg(short = 'n', long, env = "IMAGES", default_value = "10")]
        images: u32,
    },
    /// Acquire images with host timestamps
    Timed {
        #[arg(short = 'n', long, env = "IMAGES", default_value = "10")]
        images: u32,
    },
    /// Acquire images with controller timestamps
    Timestamp {
        #[arg(short = 'n', long, env = "IMAGES", default_value = "10")]
        images: u32,
    },
    /// Acquire one image signalled by the image-ready event
    Callback,
    /// Save an image with the detector temperature in its header
    TemperatureHeader,
    /// Acquire images into FITS data cubes
    Cubes {
        #[arg(short = 'n', long, env = "IMAGES", default_value = "15")]
        images: u32,

        /// Images per cube
        #[arg(long, env = "CUBE_DEPTH", default_value_t = CUBE_DEPTH)]
        depth: usize,
    },
    /// List readout modes and acquire one image with each
    ReadoutModes,
    /// Acquire binned images and a region of interest
    BinRoi,
    /// Change gains, offset and temperature and report the settings
    Gains {
        /// Print the settings report as JSON
        #[arg(long, env = "JSON")]
        json: bool,
    },
    /// Bias subtraction and photon counting
    Processing {
        /// Process on the host instead of the camera
        #[arg(long, env = "MANUAL")]
        manual: bool,

        /// Dark images averaged into the bias
        #[arg(long, env = "BIAS_STACK", default_value_t = BIAS_STACK)]
        stack: u32,

        /// Images integrated by host photon counting
        #[arg(long, env = "PC_FRAMES", default_value_t = PC_FRAMES)]
        pc_frames: u32,
    },
    /// Compare acquisition rates of full frame, binning, ROI and crop mode
    Maximize {
        /// Images timed per mode
        #[arg(short = 'n', long, env = "IMAGES", default_value = "1000")]
        images: u32,

        /// Images discarded before timing
        #[arg(long, env = "WARMUP", default_value = "10")]
        warmup: u32,
    },
    /// Live display written to a preview JPEG
    Display {
        /// Rotation in degrees, a multiple of 90
        #[arg(short, long, env = "ROTATE", default_value = "0",
              value_parser = parse_rotation, allow_negative_numbers = true)]
        rotate: Rotation,

        /// Conversion of 16-bit samples for display
        #[arg(long, env = "CONVERSION", default_value = "gray8", value_enum)]
        conversion: ConversionArg,

        /// Display refresh period in milliseconds
        #[arg(long, env = "REFRESH_MS", default_value = "40",
              value_parser = clap::value_parser!(u64).range(1..))]
        refresh_ms: u64,

        /// Preview file rewritten on every new frame
        #[arg(long, env = "PREVIEW", default_value = "preview.jpg")]
        preview: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long, env = "DURATION")]
        duration: Option<u64>,
    },
}

impl Args {
    /// Format of saved images: the one requested, otherwise JPEG for GenICam
    /// cameras and FITS for EMCCD cameras.
    pub fn image_format(&self) -> ImageFormat {
        match (self.format, &self.command) {
            (Some(f), _) => f.into(),
            (None, Command::Genicam(_)) => ImageFormat::Jpeg,
            (None, Command::Emccd(_)) => ImageFormat::Fits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_camera::save::SaveOptions;

    #[test]
    fn rotation_must_be_a_right_angle() {
        assert_eq!(parse_rotation("-90"), Ok(Rotation::Rotation270));
        assert!(parse_rotation("45").is_err());
        assert!(parse_rotation("ninety").is_err());
    }

    #[test]
    fn malformed_counts_are_usage_errors() {
        let res = Args::try_parse_from(["tao-camera", "emccd", "continuous", "-n", "ten"]);
        assert!(res.is_err());
    }

    #[test]
    fn subcommand_defaults() {
        let args =
            Args::try_parse_from(["tao-camera", "emccd", "display", "--rotate", "180"]).unwrap();
        match args.command {
            Command::Emccd(EmccdArgs {
                command: EmccdCommand::Display { rotate, .. },
                unit,
                ..
            }) => {
                assert_eq!(rotate, Rotation::Rotation180);
                assert_eq!(unit, AUTO_UNIT);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn image_format_defaults_per_family() {
        let args = Args::try_parse_from(["tao-camera", "genicam", "acquire"]).unwrap();
        assert_eq!(args.format, None);
        assert_eq!(args.image_format(), ImageFormat::Jpeg);

        let args = Args::try_parse_from(["tao-camera", "emccd", "continuous"]).unwrap();
        assert_eq!(args.image_format(), ImageFormat::Fits);

        let args =
            Args::try_parse_from(["tao-camera", "--format", "fits", "genicam", "acquire"]).unwrap();
        assert_eq!(args.image_format(), ImageFormat::Fits);
    }

    #[test]
    fn genicam_acquire_writes_jpeg_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();
        let args = Args::try_parse_from(["tao-camera", "-o", out, "genicam", "acquire"]).unwrap();
        let save = SaveOptions {
            format: args.image_format(),
            ..SaveOptions::default()
        };
        let Command::Genicam(cmd) = &args.command else {
            panic!("unexpected command {:?}", args.command);
        };
        crate::genicam_cmd::run(cmd, &args.output, &save).unwrap();
        assert!(dir.path().join("Acquisition-Continuous-0.jpg").exists());
        assert!(dir.path().join("Acquisition-Continuous-9.jpg").exists());
        assert!(!dir.path().join("Acquisition-Continuous-0.fits").exists());
    }

    #[test]
    fn refresh_period_must_be_positive() {
        let res = Args::try_parse_from(["tao-camera", "emccd", "display", "--refresh-ms", "0"]);
        assert!(res.is_err());
        let res = Args::try_parse_from(["tao-camera", "emccd", "display", "--refresh-ms", "1"]);
        assert!(res.is_ok());
    }
}
