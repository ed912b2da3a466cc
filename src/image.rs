// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    frame::{Frame, Pixels},
};
use core::fmt;
use tracing::debug;
use turbojpeg::OwnedBuf;

/// Largest value of a 16-bit sample plus one.
const U16_RANGE: u32 = 1 << 16;

/// Pixel layouts of display images.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// 8-bit gray, one byte per pixel
    Gray8,
    /// 10 bits per channel gray packed into 32 bits (x:2 r:10 g:10 b:10)
    Rgb30,
}

impl Format {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Format::Gray8 => 1,
            Format::Rgb30 => 4,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Format::Gray8 => write!(f, "GRAY8"),
            Format::Rgb30 => write!(f, "RGB30"),
        }
    }
}

/// How 16-bit camera samples are reduced for display.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Conversion {
    /// `floor(v / 65536 * 255)`
    Gray8,
    /// `255 - floor(v / 65536 * 255)`
    Gray8Inverted,
    /// 10-bit gray replicated in each channel of a 30-bit pixel
    Rgb30,
}

impl Conversion {
    pub const fn format(self) -> Format {
        match self {
            Conversion::Gray8 | Conversion::Gray8Inverted => Format::Gray8,
            Conversion::Rgb30 => Format::Rgb30,
        }
    }
}

/// Image rotation angles, clockwise.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Rotation {
    /// No rotation (0 degrees)
    #[default]
    Rotation0,
    /// Rotate 90 degrees clockwise
    Rotation90,
    /// Rotate 180 degrees
    Rotation180,
    /// Rotate 270 degrees clockwise (90 degrees counter-clockwise)
    Rotation270,
}

impl Rotation {
    /// Maps a multiple of 90 degrees (any sign) to a rotation.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        if degrees % 90 != 0 {
            return Err(Error::InvalidArgument(format!(
                "rotation must be a multiple of 90 degrees, got {degrees}"
            )));
        }
        Ok(match degrees.rem_euclid(360) {
            0 => Rotation::Rotation0,
            90 => Rotation::Rotation90,
            180 => Rotation::Rotation180,
            _ => Rotation::Rotation270,
        })
    }

    pub const fn degrees(self) -> i32 {
        match self {
            Rotation::Rotation0 => 0,
            Rotation::Rotation90 => 90,
            Rotation::Rotation180 => 180,
            Rotation::Rotation270 => 270,
        }
    }

    const fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Rotation90 | Rotation::Rotation270)
    }
}

/// Scales a 16-bit sample to 8 bits: `floor(v / 65536 * 255)`.
#[inline]
pub const fn scale_to_u8(v: u16) -> u8 {
    ((v as u32 * 255) / U16_RANGE) as u8
}

/// Inverted 8-bit scaling used for negative previews.
#[inline]
pub const fn scale_to_u8_inverted(v: u16) -> u8 {
    255 - scale_to_u8(v)
}

/// Packs a 16-bit sample as 10-bit gray into each channel of a 30-bit pixel.
#[inline]
pub const fn pack_rgb30(v: u16) -> u32 {
    let gray = (v as u32 * 1024) / U16_RANGE;
    (gray << 20) | (gray << 10) | gray
}

/// Row stride in bytes, rounded up to a 4-byte boundary as image surfaces
/// require.
pub const fn format_row_stride(format: Format, width: u32) -> usize {
    (format.bytes_per_pixel() * width as usize + 3) & !3
}

const fn image_size(width: u32, height: u32, format: Format) -> usize {
    format_row_stride(format, width) * height as usize
}

/// Host memory image ready for display or encoding.
///
/// Rows are `stride` bytes apart; bytes past `width * bytes_per_pixel` in a
/// row are padding.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: Format,
}

impl Image {
    /// Allocates a zeroed image.
    pub fn new(width: u32, height: u32, format: Format) -> Self {
        Self {
            data: vec![0; image_size(width, height, format)],
            width,
            height,
            format,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn stride(&self) -> usize {
        format_row_stride(self.format, self.width)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies another image of identical geometry into this one.
    pub fn copy_from(&mut self, other: &Image) -> Result<()> {
        if self.width != other.width || self.height != other.height || self.format != other.format
        {
            return Err(Error::InvalidArgument(format!(
                "cannot copy {other} into {self}"
            )));
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Reads the pixel at (x, y) widened to 32 bits.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride() + x as usize * bpp;
        match self.format {
            Format::Gray8 => u32::from(self.data[offset]),
            Format::Rgb30 => {
                let mut px = [0u8; 4];
                px.copy_from_slice(&self.data[offset..offset + 4]);
                u32::from_ne_bytes(px)
            }
        }
    }

    /// Returns a tightly packed 8-bit gray copy of the image.
    pub fn to_gray8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.width * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = self.pixel(x, y);
                out.push(match self.format {
                    Format::Gray8 => v as u8,
                    Format::Rgb30 => ((v & 0x3ff) >> 2) as u8,
                });
            }
        }
        out
    }

    /// Returns a rotated copy of the image.
    pub fn rotate(&self, rot: Rotation) -> Image {
        if rot == Rotation::Rotation0 {
            return self.clone();
        }
        let (w, h) = (self.width, self.height);
        let (dw, dh) = if rot.swaps_axes() { (h, w) } else { (w, h) };
        let mut dst = Image::new(dw, dh, self.format);
        let bpp = self.format.bytes_per_pixel();
        let src_stride = self.stride();
        let dst_stride = dst.stride();
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match rot {
                    Rotation::Rotation0 => (x, y),
                    Rotation::Rotation90 => (h - 1 - y, x),
                    Rotation::Rotation180 => (w - 1 - x, h - 1 - y),
                    Rotation::Rotation270 => (y, w - 1 - x),
                };
                let s = y as usize * src_stride + x as usize * bpp;
                let d = dy as usize * dst_stride + dx as usize * bpp;
                dst.data[d..d + bpp].copy_from_slice(&self.data[s..s + bpp]);
            }
        }
        dst
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} {} stride:{}",
            self.width,
            self.height,
            self.format,
            self.stride()
        )
    }
}

/// Converts a frame into `dst`, reducing the pixel depth as requested.
///
/// 8-bit frames are widened first so every conversion sees 16-bit samples.
pub fn convert(frame: &Frame, dst: &mut Image, conv: Conversion) -> Result<()> {
    if dst.width() != frame.width()
        || dst.height() != frame.height()
        || dst.format() != conv.format()
    {
        return Err(Error::InvalidArgument(format!(
            "cannot convert {}x{} frame into {} with {:?}",
            frame.width(),
            frame.height(),
            dst,
            conv
        )));
    }

    let widened;
    let samples: &[u16] = match frame.pixels() {
        Pixels::U16(p) => p,
        Pixels::U8(_) => {
            widened = frame.to_u16();
            &widened
        }
    };

    let width = frame.width() as usize;
    if width == 0 || frame.height() == 0 || samples.len() != width * frame.height() as usize {
        return Err(Error::InvalidArgument(format!(
            "frame {}x{} holds {} samples",
            frame.width(),
            frame.height(),
            samples.len()
        )));
    }
    let stride = dst.stride();
    let data = dst.as_slice_mut();
    for (row, src) in samples.chunks_exact(width).enumerate() {
        let line = &mut data[row * stride..];
        match conv {
            Conversion::Gray8 => {
                for (d, &s) in line.iter_mut().zip(src) {
                    *d = scale_to_u8(s);
                }
            }
            Conversion::Gray8Inverted => {
                for (d, &s) in line.iter_mut().zip(src) {
                    *d = scale_to_u8_inverted(s);
                }
            }
            Conversion::Rgb30 => {
                for (d, &s) in line.chunks_exact_mut(4).zip(src) {
                    d.copy_from_slice(&pack_rgb30(s).to_ne_bytes());
                }
            }
        }
    }
    Ok(())
}

/// Converts a frame into a freshly allocated image.
pub fn to_image(frame: &Frame, conv: Conversion) -> Result<Image> {
    let mut img = Image::new(frame.width(), frame.height(), conv.format());
    convert(frame, &mut img, conv)?;
    Ok(img)
}

/// Encodes an image to JPEG using turbojpeg.
///
/// Gray images are encoded as single channel JPEG; 30-bit images are first
/// reduced to 8-bit gray.
///
/// # Errors
///
/// Returns an error if JPEG compression fails.
///
/// # Example
///
/// ```no_run
/// use tao_camera::image::{encode_jpeg, Format, Image};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let img = Image::new(640, 480, Format::Gray8);
/// let jpeg = encode_jpeg(&img, 95)?;
/// println!("Compressed to {} bytes", jpeg.len());
/// # Ok(())
/// # }
/// ```
pub fn encode_jpeg(img: &Image, quality: i32) -> Result<OwnedBuf> {
    let packed;
    let (pixels, pitch) = match img.format() {
        Format::Gray8 => (img.as_slice(), img.stride()),
        Format::Rgb30 => {
            packed = img.to_gray8();
            (packed.as_slice(), img.width() as usize)
        }
    };

    let jpeg_img = turbojpeg::Image {
        width: img.width() as usize,
        height: img.height() as usize,
        format: turbojpeg::PixelFormat::GRAY,
        pixels,
        pitch,
    };

    let buf = turbojpeg::compress(jpeg_img, quality, turbojpeg::Subsamp::Gray)?;
    debug!("encoded {} to {} byte jpeg", img, buf.len());
    Ok(buf)
}
