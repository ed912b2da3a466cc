// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use unix_ts::Timestamp;

/// Pixel layout of a frame delivered by a camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit monochrome
    Mono8,
    /// 16-bit monochrome (also used for 12 and 14 bit sensors)
    Mono16,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
        }
    }

    /// GenICam symbolic name of the format.
    pub const fn name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Mono8" => Some(PixelFormat::Mono8),
            "Mono16" | "Mono12" | "Mono14" => Some(PixelFormat::Mono16),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Pixel payload of a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl Pixels {
    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(p) => p.len(),
            Pixels::U16(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion state reported by the transport for a delivered image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageStatus {
    Complete,
    /// Image is missing data; the code is transport specific.
    Incomplete(i32),
}

/// A single image as delivered by a camera.
#[derive(Clone, Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Pixels,
    /// Host frame counter, starting at zero for each acquisition.
    pub frame_id: u64,
    /// Host time of arrival.
    pub timestamp: Timestamp,
    pub status: ImageStatus,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Pixels, frame_id: u64) -> Self {
        debug_assert_eq!(pixels.len(), (width * height) as usize);
        Self {
            width,
            height,
            pixels,
            frame_id,
            timestamp: now(),
            status: ImageStatus::Complete,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Pixels {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut Pixels {
        &mut self.pixels
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self.pixels {
            Pixels::U8(_) => PixelFormat::Mono8,
            Pixels::U16(_) => PixelFormat::Mono16,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ImageStatus::Complete
    }

    /// Returns a copy of the pixels widened to 16 bits.
    pub fn to_u16(&self) -> Vec<u16> {
        match &self.pixels {
            Pixels::U16(p) => p.clone(),
            Pixels::U8(p) => p.iter().map(|&v| u16::from(v) << 8).collect(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{} {}x{} {} {}.{:09}",
            self.frame_id,
            self.width,
            self.height,
            self.pixel_format(),
            self.timestamp.seconds(),
            self.timestamp.subsec(9)
        )
    }
}

/// Current wall-clock time as a unix timestamp.
pub fn now() -> Timestamp {
    let since_the_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::new(
        since_the_epoch.as_secs() as i64,
        since_the_epoch.subsec_nanos(),
    )
}
