// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::pattern;
use crate::{
    error::{Error, Result},
    frame::{Frame, ImageStatus, PixelFormat, Pixels},
    genicam::{
        nodes, AccessMode, Camera, EnumEntry, InterfaceInfo, NodeKind, NodeMap, NodeMapExt,
        System,
    },
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};
use tracing::{debug, info};

pub const SENSOR_WIDTH: i64 = 640;
pub const SENSOR_HEIGHT: i64 = 480;
pub const EXPOSURE_MAX_US: f64 = 1_000_000.0;
pub const FRAME_RATE_MAX: f64 = 120.0;

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Integer { value: i64, min: i64, max: i64 },
    Float { value: f64, min: f64, max: f64 },
    Boolean(bool),
    Enumeration { entries: Vec<EnumEntry>, current: i64 },
    Command,
    String(String),
    Category(Vec<String>),
}

impl Value {
    fn kind(&self) -> NodeKind {
        match self {
            Value::Integer { .. } => NodeKind::Integer,
            Value::Float { .. } => NodeKind::Float,
            Value::Boolean(_) => NodeKind::Boolean,
            Value::Enumeration { .. } => NodeKind::Enumeration,
            Value::Command => NodeKind::Command,
            Value::String(_) => NodeKind::String,
            Value::Category(_) => NodeKind::Category,
        }
    }
}

#[derive(Clone, Debug)]
struct Node {
    access: AccessMode,
    value: Value,
}

/// In-memory node map.
///
/// Besides plain storage it applies the dependencies real cameras enforce:
/// offsets are bounded by the sensor size minus the image size, the exposure
/// time is only writable with automatic exposure off, and the frame rate only
/// while the frame rate limit is enabled.
#[derive(Clone, Debug, Default)]
pub struct SimNodeMap {
    nodes: BTreeMap<String, Node>,
    executed: Vec<String>,
}

impl SimNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: &str, access: AccessMode, value: Value) -> &mut Self {
        self.nodes.insert(name.to_owned(), Node { access, value });
        self
    }

    pub fn add_integer(&mut self, name: &str, value: i64, min: i64, max: i64) -> &mut Self {
        self.insert(name, AccessMode::ReadWrite, Value::Integer { value, min, max })
    }

    pub fn add_float(&mut self, name: &str, value: f64, min: f64, max: f64) -> &mut Self {
        self.insert(name, AccessMode::ReadWrite, Value::Float { value, min, max })
    }

    pub fn add_boolean(&mut self, name: &str, value: bool) -> &mut Self {
        self.insert(name, AccessMode::ReadWrite, Value::Boolean(value))
    }

    /// Adds an enumeration whose entries take the values 0, 1, 2...
    pub fn add_enum(&mut self, name: &str, entries: &[&str], current: &str) -> &mut Self {
        let entries: Vec<EnumEntry> = entries
            .iter()
            .zip(0..)
            .map(|(s, value)| EnumEntry {
                symbolic: (*s).to_owned(),
                value,
            })
            .collect();
        let current = entries
            .iter()
            .find(|e| e.symbolic == current)
            .map_or(0, |e| e.value);
        self.insert(
            name,
            AccessMode::ReadWrite,
            Value::Enumeration { entries, current },
        )
    }

    pub fn add_command(&mut self, name: &str) -> &mut Self {
        self.insert(name, AccessMode::WriteOnly, Value::Command)
    }

    pub fn add_string(&mut self, name: &str, value: &str) -> &mut Self {
        self.insert(name, AccessMode::ReadOnly, Value::String(value.to_owned()))
    }

    pub fn add_category(&mut self, name: &str, features: &[&str]) -> &mut Self {
        let features = features.iter().map(|s| (*s).to_owned()).collect();
        self.insert(name, AccessMode::ReadOnly, Value::Category(features))
    }

    /// Makes an existing node read-only.
    pub fn read_only(&mut self, name: &str) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(name) {
            node.access = AccessMode::ReadOnly;
        }
        self
    }

    /// Overrides the access mode of an existing node.
    pub fn set_access(&mut self, name: &str, access: AccessMode) -> Result<()> {
        self.node_mut(name)?.access = access;
        Ok(())
    }

    /// Commands executed so far, oldest first.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::NoSuchNode(name.to_owned()))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchNode(name.to_owned()))
    }

    fn readable(&self, name: &str) -> Result<&Value> {
        let node = self.node(name)?;
        if !node.access.is_readable() {
            return Err(Error::AccessDenied {
                node: name.to_owned(),
                access: "readable",
            });
        }
        Ok(&node.value)
    }

    fn writable(&mut self, name: &str) -> Result<&mut Value> {
        let node = self.node_mut(name)?;
        if !node.access.is_writable() {
            return Err(Error::AccessDenied {
                node: name.to_owned(),
                access: "writable",
            });
        }
        Ok(&mut node.value)
    }

    fn integer_bounds(&mut self, name: &str, max: i64) {
        if let Some(Node {
            value: Value::Integer { value, max: m, .. },
            ..
        }) = self.nodes.get_mut(name)
        {
            *m = max;
            *value = (*value).min(max);
        }
    }

    fn set_writable(&mut self, name: &str, writable: bool) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.access = if writable {
                AccessMode::ReadWrite
            } else {
                AccessMode::ReadOnly
            };
        }
    }

    fn apply_rules(&mut self, changed: &str) {
        match changed {
            nodes::WIDTH | nodes::HEIGHT => {
                let (Ok(sw), Ok(sh), Ok(w), Ok(h)) = (
                    self.integer(nodes::SENSOR_WIDTH),
                    self.integer(nodes::SENSOR_HEIGHT),
                    self.integer(nodes::WIDTH),
                    self.integer(nodes::HEIGHT),
                ) else {
                    return;
                };
                self.integer_bounds(nodes::OFFSET_X, sw - w);
                self.integer_bounds(nodes::OFFSET_Y, sh - h);
            }
            nodes::EXPOSURE_AUTO => {
                let manual = self
                    .enum_current(nodes::EXPOSURE_AUTO)
                    .is_ok_and(|e| e.symbolic == "Off");
                self.set_writable(nodes::EXPOSURE_TIME, manual);
            }
            nodes::ACQUISITION_FRAME_RATE_ENABLE => {
                let enabled = self
                    .boolean(nodes::ACQUISITION_FRAME_RATE_ENABLE)
                    .unwrap_or(false);
                self.set_writable(nodes::ACQUISITION_FRAME_RATE, enabled);
            }
            _ => {}
        }
    }

    fn type_error(name: &str, expected: NodeKind, actual: &Value) -> Error {
        Error::NodeType {
            node: name.to_owned(),
            expected: expected.name(),
            actual: actual.kind().name(),
        }
    }
}

impl NodeMap for SimNodeMap {
    fn access(&self, name: &str) -> AccessMode {
        self.nodes
            .get(name)
            .map_or(AccessMode::NotImplemented, |n| n.access)
    }

    fn kind(&self, name: &str) -> Result<NodeKind> {
        Ok(self.node(name)?.value.kind())
    }

    fn integer(&self, name: &str) -> Result<i64> {
        match self.readable(name)? {
            Value::Integer { value, .. } => Ok(*value),
            v => Err(Self::type_error(name, NodeKind::Integer, v)),
        }
    }

    fn integer_range(&self, name: &str) -> Result<(i64, i64)> {
        match self.readable(name)? {
            Value::Integer { min, max, .. } => Ok((*min, *max)),
            v => Err(Self::type_error(name, NodeKind::Integer, v)),
        }
    }

    fn set_integer(&mut self, name: &str, value: i64) -> Result<()> {
        match self.writable(name)? {
            Value::Integer { value: v, min, max } => {
                if value < *min || value > *max {
                    return Err(Error::InvalidArgument(format!(
                        "{name} value {value} outside [{min}, {max}]"
                    )));
                }
                *v = value;
            }
            v => return Err(Self::type_error(name, NodeKind::Integer, v)),
        }
        self.apply_rules(name);
        Ok(())
    }

    fn float(&self, name: &str) -> Result<f64> {
        match self.readable(name)? {
            Value::Float { value, .. } => Ok(*value),
            v => Err(Self::type_error(name, NodeKind::Float, v)),
        }
    }

    fn float_range(&self, name: &str) -> Result<(f64, f64)> {
        match self.readable(name)? {
            Value::Float { min, max, .. } => Ok((*min, *max)),
            v => Err(Self::type_error(name, NodeKind::Float, v)),
        }
    }

    fn set_float(&mut self, name: &str, value: f64) -> Result<()> {
        match self.writable(name)? {
            Value::Float { value: v, min, max } => {
                if value < *min || value > *max {
                    return Err(Error::InvalidArgument(format!(
                        "{name} value {value} outside [{min}, {max}]"
                    )));
                }
                *v = value;
            }
            v => return Err(Self::type_error(name, NodeKind::Float, v)),
        }
        self.apply_rules(name);
        Ok(())
    }

    fn boolean(&self, name: &str) -> Result<bool> {
        match self.readable(name)? {
            Value::Boolean(b) => Ok(*b),
            v => Err(Self::type_error(name, NodeKind::Boolean, v)),
        }
    }

    fn set_boolean(&mut self, name: &str, value: bool) -> Result<()> {
        match self.writable(name)? {
            Value::Boolean(b) => *b = value,
            v => return Err(Self::type_error(name, NodeKind::Boolean, v)),
        }
        self.apply_rules(name);
        Ok(())
    }

    fn enum_entries(&self, name: &str) -> Result<Vec<EnumEntry>> {
        match &self.node(name)?.value {
            Value::Enumeration { entries, .. } => Ok(entries.clone()),
            v => Err(Self::type_error(name, NodeKind::Enumeration, v)),
        }
    }

    fn enum_current(&self, name: &str) -> Result<EnumEntry> {
        match self.readable(name)? {
            Value::Enumeration { entries, current } => entries
                .iter()
                .find(|e| e.value == *current)
                .cloned()
                .ok_or_else(|| Error::NoSuchEntry {
                    node: name.to_owned(),
                    entry: current.to_string(),
                }),
            v => Err(Self::type_error(name, NodeKind::Enumeration, v)),
        }
    }

    fn set_enum(&mut self, name: &str, value: i64) -> Result<()> {
        match self.writable(name)? {
            Value::Enumeration { entries, current } => {
                if !entries.iter().any(|e| e.value == value) {
                    return Err(Error::NoSuchEntry {
                        node: name.to_owned(),
                        entry: value.to_string(),
                    });
                }
                *current = value;
            }
            v => return Err(Self::type_error(name, NodeKind::Enumeration, v)),
        }
        self.apply_rules(name);
        Ok(())
    }

    fn string(&self, name: &str) -> Result<String> {
        match self.readable(name)? {
            Value::String(s) => Ok(s.clone()),
            v => Err(Self::type_error(name, NodeKind::String, v)),
        }
    }

    fn execute(&mut self, name: &str) -> Result<()> {
        match self.writable(name)? {
            Value::Command => {}
            v => return Err(Self::type_error(name, NodeKind::Command, v)),
        }
        debug!("executed {name}");
        self.executed.push(name.to_owned());
        Ok(())
    }

    fn category_features(&self, name: &str) -> Result<Vec<String>> {
        match self.readable(name)? {
            Value::Category(f) => Ok(f.clone()),
            v => Err(Self::type_error(name, NodeKind::Category, v)),
        }
    }
}

/// Node map of a monochrome area-scan camera.
pub fn camera_node_map() -> SimNodeMap {
    let mut map = SimNodeMap::new();
    map.add_category(
        nodes::ROOT,
        &["ImageFormatControl", "AcquisitionControl", "DeviceControl"],
    )
    .add_category(
        nodes::IMAGE_FORMAT_CONTROL,
        &[
            nodes::SENSOR_WIDTH,
            nodes::SENSOR_HEIGHT,
            nodes::WIDTH_MAX,
            nodes::HEIGHT_MAX,
            nodes::WIDTH,
            nodes::HEIGHT,
            nodes::OFFSET_X,
            nodes::OFFSET_Y,
            nodes::REVERSE_X,
            nodes::PIXEL_FORMAT,
            nodes::PIXEL_CODING,
        ],
    )
    .add_integer(nodes::SENSOR_WIDTH, SENSOR_WIDTH, SENSOR_WIDTH, SENSOR_WIDTH)
    .add_integer(nodes::SENSOR_HEIGHT, SENSOR_HEIGHT, SENSOR_HEIGHT, SENSOR_HEIGHT)
    .add_integer(nodes::WIDTH_MAX, SENSOR_WIDTH, SENSOR_WIDTH, SENSOR_WIDTH)
    .add_integer(nodes::HEIGHT_MAX, SENSOR_HEIGHT, SENSOR_HEIGHT, SENSOR_HEIGHT)
    .add_integer(nodes::WIDTH, SENSOR_WIDTH, 16, SENSOR_WIDTH)
    .add_integer(nodes::HEIGHT, SENSOR_HEIGHT, 16, SENSOR_HEIGHT)
    .add_integer(nodes::OFFSET_X, 0, 0, 0)
    .add_integer(nodes::OFFSET_Y, 0, 0, 0)
    .add_boolean(nodes::REVERSE_X, false)
    .add_enum(nodes::PIXEL_FORMAT, &["Mono8", "Mono16"], "Mono8")
    .add_enum(nodes::PIXEL_CODING, &["Mono", "MonoSigned"], "Mono")
    .add_category(
        "AcquisitionControl",
        &[
            nodes::ACQUISITION_MODE,
            nodes::EXPOSURE_AUTO,
            nodes::EXPOSURE_TIME,
            nodes::ACQUISITION_FRAME_RATE_ENABLE,
            nodes::ACQUISITION_FRAME_RATE,
        ],
    )
    .add_enum(
        nodes::ACQUISITION_MODE,
        &["Continuous", "SingleFrame", "MultiFrame"],
        "Continuous",
    )
    .add_enum(nodes::EXPOSURE_AUTO, &["Off", "Once", "Continuous"], "Continuous")
    .add_float(nodes::EXPOSURE_TIME, 10_000.0, 10.0, EXPOSURE_MAX_US)
    .add_boolean(nodes::ACQUISITION_FRAME_RATE_ENABLE, false)
    .add_float(nodes::ACQUISITION_FRAME_RATE, 30.0, 1.0, FRAME_RATE_MAX)
    .add_category("DeviceControl", &[nodes::DEVICE_RESET])
    .add_command(nodes::DEVICE_RESET)
    .read_only(nodes::SENSOR_WIDTH)
    .read_only(nodes::SENSOR_HEIGHT)
    .read_only(nodes::WIDTH_MAX)
    .read_only(nodes::HEIGHT_MAX);
    map.apply_rules(nodes::EXPOSURE_AUTO);
    map.apply_rules(nodes::ACQUISITION_FRAME_RATE_ENABLE);
    map
}

fn tl_device_node_map(index: usize, serial: &str) -> SimNodeMap {
    let mut map = SimNodeMap::new();
    map.add_category(nodes::ROOT, &["DeviceInformation"])
        .add_category(
            "DeviceInformation",
            &[
                nodes::DEVICE_VENDOR_NAME,
                nodes::DEVICE_MODEL_NAME,
                nodes::DEVICE_SERIAL_NUMBER,
                "DeviceID",
            ],
        )
        .add_string(nodes::DEVICE_VENDOR_NAME, "TAO")
        .add_string(nodes::DEVICE_MODEL_NAME, "Simulated Mono Camera")
        .add_string(nodes::DEVICE_SERIAL_NUMBER, serial)
        .add_string("DeviceID", &format!("sim-{index}"));
    map
}

fn tl_stream_node_map(index: usize) -> SimNodeMap {
    let mut map = SimNodeMap::new();
    map.add_category(
        nodes::ROOT,
        &[
            nodes::STREAM_ID,
            nodes::STREAM_TYPE,
            nodes::STREAM_BUFFER_COUNT,
        ],
    )
    .add_string(nodes::STREAM_ID, &format!("Stream{index}"))
    .add_enum(nodes::STREAM_TYPE, &["USB3", "GigEVision"], "USB3")
    .add_integer(nodes::STREAM_BUFFER_COUNT, 10, 1, 100);
    map
}

/// Simulated camera attached to the [`SimSystem`].
pub struct SimCamera {
    serial: String,
    initialized: bool,
    acquiring: bool,
    single_frame_done: bool,
    frame_count: u64,
    incomplete_every: Option<u64>,
    map: SimNodeMap,
    tl_device: SimNodeMap,
    tl_stream: SimNodeMap,
    _system: Arc<SimSystem>,
}

impl SimCamera {
    fn new(system: Arc<SimSystem>, index: usize) -> Self {
        let serial = format!("{}", 19_000_000 + index);
        Self {
            tl_device: tl_device_node_map(index, &serial),
            tl_stream: tl_stream_node_map(index),
            map: camera_node_map(),
            serial,
            initialized: false,
            acquiring: false,
            single_frame_done: false,
            frame_count: 0,
            incomplete_every: None,
            _system: system,
        }
    }

    /// Marks every `n`th delivered image as incomplete.
    pub fn with_incomplete_every(mut self, n: u64) -> Self {
        self.incomplete_every = Some(n.max(1));
        self
    }

    /// Node map access without the initialization check, for inspection.
    pub fn sim_node_map(&self) -> &SimNodeMap {
        &self.map
    }

    fn render(&self) -> Result<Frame> {
        let int = |n: &str| self.map.integer(n);
        let (w, h) = (int(nodes::WIDTH)?, int(nodes::HEIGHT)?);
        let (ox, oy) = (int(nodes::OFFSET_X)?, int(nodes::OFFSET_Y)?);
        let reverse = self.map.boolean(nodes::REVERSE_X)?;
        let full = pattern::generate(
            SENSOR_WIDTH as u32,
            SENSOR_HEIGHT as u32,
            self.frame_count,
            pattern::BIAS_LEVEL,
        );

        let mut roi = Vec::with_capacity((w * h) as usize);
        for y in oy..oy + h {
            let row = &full[(y * SENSOR_WIDTH) as usize..((y + 1) * SENSOR_WIDTH) as usize];
            let cols = &row[ox as usize..(ox + w) as usize];
            if reverse {
                roi.extend(cols.iter().rev());
            } else {
                roi.extend_from_slice(cols);
            }
        }

        let format = self.map.enum_current(nodes::PIXEL_FORMAT)?;
        let pixels = match PixelFormat::from_name(&format.symbolic) {
            Some(PixelFormat::Mono8) => Pixels::U8(roi.iter().map(|&v| (v >> 8) as u8).collect()),
            Some(PixelFormat::Mono16) => Pixels::U16(roi),
            None => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported pixel format {}",
                    format.symbolic
                )))
            }
        };
        Ok(Frame::new(w as u32, h as u32, pixels, self.frame_count))
    }
}

impl Camera for SimCamera {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        debug!("camera {} initialized", self.serial);
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if self.acquiring {
            self.end_acquisition()?;
        }
        self.initialized = false;
        debug!("camera {} deinitialized", self.serial);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn node_map(&mut self) -> Result<&mut dyn NodeMap> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        Ok(&mut self.map)
    }

    fn tl_device_node_map(&mut self) -> &mut dyn NodeMap {
        &mut self.tl_device
    }

    fn tl_stream_node_map(&mut self) -> &mut dyn NodeMap {
        &mut self.tl_stream
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        self.acquiring = true;
        self.single_frame_done = false;
        self.frame_count = 0;
        info!("camera {} acquiring images", self.serial);
        Ok(())
    }

    fn next_image(&mut self, timeout: Duration) -> Result<Frame> {
        if !self.acquiring {
            return Err(Error::NotAcquiring);
        }
        let single = self.map.enum_current(nodes::ACQUISITION_MODE)?.symbolic == "SingleFrame";
        if single && self.single_frame_done {
            thread::sleep(timeout);
            return Err(Error::Timeout(timeout));
        }
        if self.map.is_readable(nodes::ACQUISITION_FRAME_RATE_ENABLE)
            && self.map.boolean(nodes::ACQUISITION_FRAME_RATE_ENABLE)?
        {
            let fps = self.map.float(nodes::ACQUISITION_FRAME_RATE)?;
            thread::sleep(Duration::from_secs_f64(1.0 / fps).min(timeout));
        }

        let mut frame = self.render()?;
        self.frame_count += 1;
        self.single_frame_done = single;
        if let Some(n) = self.incomplete_every {
            if self.frame_count % n == 0 {
                frame.status = ImageStatus::Incomplete(1);
            }
        }
        Ok(frame)
    }

    fn end_acquisition(&mut self) -> Result<()> {
        if !self.acquiring {
            return Err(Error::NotAcquiring);
        }
        self.acquiring = false;
        debug!("camera {} stopped after {} images", self.serial, self.frame_count);
        Ok(())
    }

    fn serial(&mut self) -> Result<String> {
        Ok(self.serial.clone())
    }
}

/// Number of cameras a fresh system reports.
pub const DEFAULT_CAMERAS: usize = 1;

static INSTANCE: Mutex<Weak<SimSystem>> = Mutex::new(Weak::new());

/// Simulated GenICam system.
///
/// [`SimSystem::instance`] hands out references to a single live system; it
/// is released once the last reference (including those held by cameras) is
/// dropped.
#[derive(Debug)]
pub struct SimSystem {
    cameras: AtomicUsize,
}

impl SimSystem {
    pub fn instance() -> Arc<SimSystem> {
        let mut slot = INSTANCE.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(system) = slot.upgrade() {
            return system;
        }
        let system = Arc::new(SimSystem {
            cameras: AtomicUsize::new(DEFAULT_CAMERAS),
        });
        *slot = Arc::downgrade(&system);
        info!("system instance created");
        system
    }

    /// Changes how many cameras the system reports.
    pub fn set_camera_count(&self, count: usize) {
        self.cameras.store(count, Ordering::Relaxed);
    }

    /// Creates the simulated camera `index` directly, for callers needing
    /// its concrete type.
    pub fn camera(&self, index: usize) -> Result<SimCamera> {
        let count = self.cameras.load(Ordering::Relaxed);
        if index >= count {
            return Err(Error::CameraIndex { index, count });
        }
        Ok(SimCamera::new(SimSystem::instance(), index))
    }
}

impl Drop for SimSystem {
    fn drop(&mut self) {
        info!("system instance released");
    }
}

impl System for SimSystem {
    fn version(&self) -> String {
        format!("{}.0.0.0", env!("CARGO_PKG_VERSION_MAJOR"))
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(vec![InterfaceInfo {
            name: "Simulated USB3 Interface".to_owned(),
            cameras: self.cameras.load(Ordering::Relaxed),
        }])
    }

    fn cameras(&self) -> Result<Vec<Box<dyn Camera>>> {
        let count = self.cameras.load(Ordering::Relaxed);
        Ok((0..count)
            .map(|i| Box::new(SimCamera::new(SimSystem::instance(), i)) as Box<dyn Camera>)
            .collect())
    }
}
