// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! GenICam camera access.
//!
//! Cameras expose their features as a map of named, typed nodes. Every node
//! carries an access mode which must be checked before reading or writing;
//! [`NodeMapExt`] bundles those checks with the common "cap to maximum then
//! write" patterns so configuration routines stay short.

use crate::{
    error::{Error, Result},
    frame::{Frame, ImageStatus},
    save::{save_frame, SaveOptions},
};
use serde_json::{json, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Standard feature names.
pub mod nodes {
    pub const ACQUISITION_FRAME_RATE: &str = "AcquisitionFrameRate";
    pub const ACQUISITION_FRAME_RATE_ENABLE: &str = "AcquisitionFrameRateEnable";
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    pub const DEVICE_MODEL_NAME: &str = "DeviceModelName";
    pub const DEVICE_RESET: &str = "DeviceReset";
    pub const DEVICE_SERIAL_NUMBER: &str = "DeviceSerialNumber";
    pub const DEVICE_VENDOR_NAME: &str = "DeviceVendorName";
    pub const EXPOSURE_AUTO: &str = "ExposureAuto";
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const HEIGHT: &str = "Height";
    pub const HEIGHT_MAX: &str = "HeightMax";
    pub const IMAGE_FORMAT_CONTROL: &str = "ImageFormatControl";
    pub const OFFSET_X: &str = "OffsetX";
    pub const OFFSET_Y: &str = "OffsetY";
    pub const PIXEL_CODING: &str = "PixelCoding";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const REVERSE_X: &str = "ReverseX";
    pub const ROOT: &str = "Root";
    pub const SENSOR_HEIGHT: &str = "SensorHeight";
    pub const SENSOR_WIDTH: &str = "SensorWidth";
    pub const STREAM_BUFFER_COUNT: &str = "StreamDefaultBufferCount";
    pub const STREAM_ID: &str = "StreamID";
    pub const STREAM_TYPE: &str = "StreamType";
    pub const WIDTH: &str = "Width";
    pub const WIDTH_MAX: &str = "WidthMax";
}

/// Text printed in feature dumps for nodes that cannot be read.
pub const NOT_READABLE: &str = "Node not readable";

/// Default time to wait for the next image.
pub const IMAGE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    NotImplemented,
    NotAvailable,
    WriteOnly,
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_available(self) -> bool {
        !matches!(self, AccessMode::NotImplemented | AccessMode::NotAvailable)
    }

    pub fn is_readable(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Integer,
    Float,
    Boolean,
    Enumeration,
    Command,
    String,
    Category,
}

impl NodeKind {
    pub const fn name(self) -> &'static str {
        match self {
            NodeKind::Integer => "integer",
            NodeKind::Float => "float",
            NodeKind::Boolean => "boolean",
            NodeKind::Enumeration => "enumeration",
            NodeKind::Command => "command",
            NodeKind::String => "string",
            NodeKind::Category => "category",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry of an enumeration node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumEntry {
    pub symbolic: String,
    pub value: i64,
}

/// Typed access to the feature nodes of a camera or transport layer.
///
/// Nodes the device does not implement report [`AccessMode::NotImplemented`]
/// and fail every other call with [`Error::NoSuchNode`].
pub trait NodeMap {
    fn access(&self, name: &str) -> AccessMode;
    fn kind(&self, name: &str) -> Result<NodeKind>;

    fn integer(&self, name: &str) -> Result<i64>;
    fn integer_range(&self, name: &str) -> Result<(i64, i64)>;
    fn set_integer(&mut self, name: &str, value: i64) -> Result<()>;

    fn float(&self, name: &str) -> Result<f64>;
    fn float_range(&self, name: &str) -> Result<(f64, f64)>;
    fn set_float(&mut self, name: &str, value: f64) -> Result<()>;

    fn boolean(&self, name: &str) -> Result<bool>;
    fn set_boolean(&mut self, name: &str, value: bool) -> Result<()>;

    fn enum_entries(&self, name: &str) -> Result<Vec<EnumEntry>>;
    fn enum_current(&self, name: &str) -> Result<EnumEntry>;
    fn set_enum(&mut self, name: &str, value: i64) -> Result<()>;

    fn string(&self, name: &str) -> Result<String>;
    fn execute(&mut self, name: &str) -> Result<()>;

    /// Features (and sub-categories) of a category node, in display order.
    fn category_features(&self, name: &str) -> Result<Vec<String>>;

    /// Current value of any readable node rendered as text.
    fn value_string(&self, name: &str) -> Result<String> {
        Ok(match self.kind(name)? {
            NodeKind::Integer => self.integer(name)?.to_string(),
            NodeKind::Float => format!("{:.2}", self.float(name)?),
            NodeKind::Boolean => self.boolean(name)?.to_string(),
            NodeKind::Enumeration => self.enum_current(name)?.symbolic,
            NodeKind::String => self.string(name)?,
            NodeKind::Command => "(command)".to_owned(),
            NodeKind::Category => "(category)".to_owned(),
        })
    }
}

/// One line of a category dump.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub depth: usize,
    pub name: String,
    /// `None` when the node is not readable; empty for categories.
    pub value: Option<String>,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let indent = "    ".repeat(self.depth);
        match &self.value {
            Some(v) if v.is_empty() => write!(f, "{indent}{}", self.name),
            Some(v) => write!(f, "{indent}{}: {v}", self.name),
            None => write!(f, "{indent}{}: {NOT_READABLE}", self.name),
        }
    }
}

/// Capability queries and configuration patterns over any [`NodeMap`].
pub trait NodeMapExt: NodeMap {
    fn is_available(&self, name: &str) -> bool {
        self.access(name).is_available()
    }

    fn is_readable(&self, name: &str) -> bool {
        let access = self.access(name);
        access.is_available() && access.is_readable()
    }

    fn is_writable(&self, name: &str) -> bool {
        let access = self.access(name);
        access.is_available() && access.is_writable()
    }

    fn ensure_readable(&self, name: &str) -> Result<()> {
        if self.access(name) == AccessMode::NotImplemented {
            return Err(Error::NoSuchNode(name.to_owned()));
        }
        if !self.is_readable(name) {
            return Err(Error::AccessDenied {
                node: name.to_owned(),
                access: "readable",
            });
        }
        Ok(())
    }

    fn ensure_writable(&self, name: &str) -> Result<()> {
        if self.access(name) == AccessMode::NotImplemented {
            return Err(Error::NoSuchNode(name.to_owned()));
        }
        if !self.is_writable(name) {
            return Err(Error::AccessDenied {
                node: name.to_owned(),
                access: "writable",
            });
        }
        Ok(())
    }

    /// Caps `value` to the node maximum when it is readable and writes it.
    /// Returns the value applied.
    fn set_integer_capped(&mut self, name: &str, value: i64) -> Result<i64> {
        let value = if self.is_readable(name) {
            let (_, max) = self.integer_range(name)?;
            if value > max {
                debug!("{name} capped from {value} to {max}");
            }
            value.min(max)
        } else {
            value
        };
        self.ensure_writable(name)?;
        self.set_integer(name, value)?;
        Ok(value)
    }

    /// Floating point counterpart of [`NodeMapExt::set_integer_capped`].
    fn set_float_capped(&mut self, name: &str, value: f64) -> Result<f64> {
        let value = if self.is_readable(name) {
            let (_, max) = self.float_range(name)?;
            if value > max {
                debug!("{name} capped from {value} to {max}");
            }
            value.min(max)
        } else {
            value
        };
        self.ensure_writable(name)?;
        self.set_float(name, value)?;
        Ok(value)
    }

    /// Selects an enumeration entry by symbolic name and returns its value.
    fn set_enum_by_name(&mut self, name: &str, entry: &str) -> Result<i64> {
        self.ensure_readable(name)?;
        self.ensure_writable(name)?;
        let value = self
            .enum_entries(name)?
            .into_iter()
            .find(|e| e.symbolic == entry)
            .map(|e| e.value)
            .ok_or_else(|| Error::NoSuchEntry {
                node: name.to_owned(),
                entry: entry.to_owned(),
            })?;
        self.set_enum(name, value)?;
        debug!("{name} set to {entry} ({value})");
        Ok(value)
    }

    fn set_boolean_checked(&mut self, name: &str, value: bool) -> Result<()> {
        self.ensure_writable(name)?;
        self.set_boolean(name, value)
    }

    fn execute_checked(&mut self, name: &str) -> Result<()> {
        self.ensure_writable(name)?;
        self.execute(name)
    }

    /// Walks a category and its sub-categories.
    fn dump_category(&self, name: &str) -> Result<Vec<Feature>> {
        let mut out = Vec::new();
        dump_into(self, name, 0, &mut out)?;
        Ok(out)
    }
}

impl<T: NodeMap + ?Sized> NodeMapExt for T {}

fn dump_into<M: NodeMap + ?Sized>(
    map: &M,
    name: &str,
    depth: usize,
    out: &mut Vec<Feature>,
) -> Result<()> {
    map.ensure_readable(name)?;
    for feature in map.category_features(name)? {
        if !map.is_available(&feature) {
            continue;
        }
        if !map.is_readable(&feature) {
            out.push(Feature {
                depth,
                name: feature,
                value: None,
            });
            continue;
        }
        if map.kind(&feature)? == NodeKind::Category {
            out.push(Feature {
                depth,
                value: Some(String::new()),
                name: feature.clone(),
            });
            dump_into(map, &feature, depth + 1, out)?;
        } else {
            let value = map.value_string(&feature)?;
            out.push(Feature {
                depth,
                name: feature,
                value: Some(value),
            });
        }
    }
    Ok(())
}

/// Renders a dump as a JSON object of name to value, nesting categories.
pub fn features_to_json(features: &[Feature]) -> Value {
    fn build(features: &[Feature], pos: &mut usize, depth: usize) -> Value {
        let mut obj = serde_json::Map::new();
        while *pos < features.len() && features[*pos].depth == depth {
            let f = &features[*pos];
            *pos += 1;
            let nested = *pos < features.len() && features[*pos].depth > depth;
            let value = if nested {
                build(features, pos, depth + 1)
            } else {
                match &f.value {
                    Some(v) => json!(v),
                    None => Value::Null,
                }
            };
            obj.insert(f.name.clone(), value);
        }
        Value::Object(obj)
    }
    let mut pos = 0;
    build(features, &mut pos, 0)
}

/// A transport interface and the number of cameras attached to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub cameras: usize,
}

/// Entry point of a GenICam SDK. Implementations are process-wide singletons
/// shared through reference counting.
pub trait System: Send + Sync {
    /// Library version as `major.minor.type.build`.
    fn version(&self) -> String;
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>>;
    fn cameras(&self) -> Result<Vec<Box<dyn Camera>>>;
}

/// A GenICam camera.
///
/// Transport-layer maps are usable before [`Camera::init`]; the camera node
/// map requires initialization.
pub trait Camera: Send {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self) -> Result<()>;
    fn is_initialized(&self) -> bool;

    fn node_map(&mut self) -> Result<&mut dyn NodeMap>;
    fn tl_device_node_map(&mut self) -> &mut dyn NodeMap;
    fn tl_stream_node_map(&mut self) -> &mut dyn NodeMap;

    fn begin_acquisition(&mut self) -> Result<()>;
    /// Waits up to `timeout` for the next image. Incomplete images are
    /// returned with [`crate::frame::ImageStatus::Incomplete`].
    fn next_image(&mut self, timeout: Duration) -> Result<Frame>;
    fn end_acquisition(&mut self) -> Result<()>;

    fn serial(&mut self) -> Result<String> {
        self.tl_device_node_map().string(nodes::DEVICE_SERIAL_NUMBER)
    }
}

/// Picks camera `index` from the system's camera list.
pub fn select_camera(system: &dyn System, index: usize) -> Result<Box<dyn Camera>> {
    let mut cameras = system.cameras()?;
    let count = cameras.len();
    info!("number of cameras detected: {count}");
    if count == 0 {
        return Err(Error::NoCamera);
    }
    if index >= count {
        return Err(Error::CameraIndex { index, count });
    }
    Ok(cameras.swap_remove(index))
}

/// Turns automatic exposure off and applies `exposure_us`, capped to the
/// camera maximum. Returns the exposure applied.
pub fn configure_exposure(map: &mut dyn NodeMap, exposure_us: f64) -> Result<f64> {
    map.set_enum_by_name(nodes::EXPOSURE_AUTO, "Off")?;
    let applied = map.set_float_capped(nodes::EXPOSURE_TIME, exposure_us)?;
    info!("exposure time set to {applied} us");
    Ok(applied)
}

/// Returns the camera to continuous automatic exposure.
pub fn reset_exposure(map: &mut dyn NodeMap) -> Result<()> {
    map.set_enum_by_name(nodes::EXPOSURE_AUTO, "Continuous")?;
    info!("automatic exposure enabled");
    Ok(())
}

/// Requested image format settings; `None` leaves a setting untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageFormatConfig {
    pub pixel_format: Option<String>,
    pub pixel_coding: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub offset_x: Option<i64>,
    pub offset_y: Option<i64>,
    pub reverse_x: Option<bool>,
}

/// Settings actually applied by [`configure_image_format`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppliedFormat {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub offset_x: Option<i64>,
    pub offset_y: Option<i64>,
}

/// Applies pixel format, coding, size, offsets and mirroring in that order.
/// Size and offsets are capped to the camera maxima.
pub fn configure_image_format(
    map: &mut dyn NodeMap,
    cfg: &ImageFormatConfig,
) -> Result<AppliedFormat> {
    if let Some(fmt) = &cfg.pixel_format {
        map.set_enum_by_name(nodes::PIXEL_FORMAT, fmt)?;
        info!("pixel format set to {fmt}");
    }
    if let Some(coding) = &cfg.pixel_coding {
        map.set_enum_by_name(nodes::PIXEL_CODING, coding)?;
        info!("pixel coding set to {coding}");
    }

    let mut applied = AppliedFormat::default();
    // Size first: offset maxima depend on it.
    for (node, req, out) in [
        (nodes::WIDTH, cfg.width, &mut applied.width),
        (nodes::HEIGHT, cfg.height, &mut applied.height),
        (nodes::OFFSET_X, cfg.offset_x, &mut applied.offset_x),
        (nodes::OFFSET_Y, cfg.offset_y, &mut applied.offset_y),
    ] {
        if let Some(v) = req {
            let set = map.set_integer_capped(node, v)?;
            info!("{node} set to {set}");
            *out = Some(set);
        }
    }

    if let Some(reverse) = cfg.reverse_x {
        map.set_boolean_checked(nodes::REVERSE_X, reverse)?;
        info!("reverse x set to {reverse}");
    }
    Ok(applied)
}

/// Sends the device reset command.
pub fn device_reset(map: &mut dyn NodeMap) -> Result<()> {
    map.execute_checked(nodes::DEVICE_RESET)?;
    info!("device reset issued");
    Ok(())
}

/// Enables the frame rate limit and sets it, capped to the camera maximum.
pub fn set_frame_rate(map: &mut dyn NodeMap, fps: f64) -> Result<f64> {
    map.set_boolean_checked(nodes::ACQUISITION_FRAME_RATE_ENABLE, true)?;
    let applied = map.set_float_capped(nodes::ACQUISITION_FRAME_RATE, fps)?;
    info!("frame rate limited to {applied:.2} fps");
    Ok(applied)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    SingleFrame,
    Continuous,
}

impl AcquisitionMode {
    pub const fn symbolic(self) -> &'static str {
        match self {
            AcquisitionMode::SingleFrame => "SingleFrame",
            AcquisitionMode::Continuous => "Continuous",
        }
    }
}

/// How saved images are named.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Naming {
    /// `Acquisition_SingleFrame` or `Acquisition-Continuous-<n>`.
    #[default]
    Sequence,
    /// `Acquisition-<serial>-<n>`.
    Serial,
}

#[derive(Clone, Debug)]
pub struct AcquireOptions {
    pub mode: AcquisitionMode,
    /// Images requested; forced to one in single-frame mode.
    pub count: usize,
    pub frame_rate: Option<f64>,
    pub timeout: Duration,
    pub naming: Naming,
    pub save: SaveOptions,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::SingleFrame,
            count: 1,
            frame_rate: None,
            timeout: IMAGE_TIMEOUT,
            naming: Naming::Sequence,
            save: SaveOptions::jpeg(),
        }
    }
}

fn image_name(opts: &AcquireOptions, serial: Option<&str>, n: usize) -> String {
    match (opts.naming, serial, opts.mode) {
        (Naming::Serial, Some(serial), _) => format!("Acquisition-{serial}-{n}"),
        (_, _, AcquisitionMode::SingleFrame) => "Acquisition_SingleFrame".to_owned(),
        (_, _, AcquisitionMode::Continuous) => format!("Acquisition-Continuous-{n}"),
    }
}

/// Acquires and saves images from an initialized camera.
///
/// Incomplete images are logged and skipped; they still count towards the
/// requested number. Acquisition is ended even when saving fails.
#[instrument(skip_all, fields(mode = opts.mode.symbolic(), count = opts.count))]
pub fn acquire_images(
    camera: &mut dyn Camera,
    opts: &AcquireOptions,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let serial = match opts.naming {
        Naming::Serial => Some(camera.serial()?),
        Naming::Sequence => None,
    };

    {
        let map = camera.node_map()?;
        map.set_enum_by_name(nodes::ACQUISITION_MODE, opts.mode.symbolic())?;
        info!("acquisition mode set to {}", opts.mode.symbolic());
        if let Some(fps) = opts.frame_rate {
            set_frame_rate(map, fps)?;
        }
    }

    let count = match opts.mode {
        AcquisitionMode::SingleFrame => 1,
        AcquisitionMode::Continuous => opts.count,
    };

    camera.begin_acquisition()?;
    let mut saved = Vec::with_capacity(count);
    let res = (|| -> Result<()> {
        for n in 0..count {
            let frame = camera.next_image(opts.timeout)?;
            if let ImageStatus::Incomplete(status) = frame.status {
                warn!("image incomplete with image status {status}");
                continue;
            }
            info!(
                "grabbed image {n}, width = {}, height = {}",
                frame.width(),
                frame.height()
            );
            let name = image_name(opts, serial.as_deref(), n);
            saved.push(save_frame(&frame, dir, &name, &opts.save)?);
        }
        Ok(())
    })();
    let end = camera.end_acquisition();
    res?;
    end?;
    Ok(saved)
}

/// Opens camera `index`, checks its node map is usable and selects
/// continuous acquisition, then releases it.
pub fn check_camera(system: &dyn System, index: usize) -> Result<()> {
    for iface in system.interfaces()? {
        debug!("interface {}: {} camera(s)", iface.name, iface.cameras);
    }
    let mut camera = select_camera(system, index)?;
    camera.init()?;
    let res = camera
        .node_map()
        .and_then(|map| map.set_enum_by_name(nodes::ACQUISITION_MODE, "Continuous"));
    let deinit = camera.deinit();
    res?;
    deinit?;
    info!("camera {index} is operational");
    Ok(())
}
