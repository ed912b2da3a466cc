// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Minimal FITS writer for monochrome frames.
//!
//! Only the primary HDU is produced. 16-bit frames are stored as signed
//! 16-bit integers with `BZERO = 32768`, the standard convention for unsigned
//! data. Data cubes stack frames of identical geometry along `NAXIS3`.

use crate::{
    error::{Error, Result},
    frame::{Frame, Pixels},
};

pub const BLOCK_SIZE: usize = 2880;
pub const CARD_SIZE: usize = 80;

/// Optional acquisition metadata recorded in the header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Meta {
    pub comment: Option<String>,
    /// Exposure time in milliseconds.
    pub exposure_ms: Option<f64>,
    /// Detector temperature in degrees Celsius.
    pub temperature: Option<f64>,
}

/// A primary header under construction.
#[derive(Clone, Debug, Default)]
pub struct Header {
    cards: Vec<String>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_value(&mut self, key: &str, value: &str, comment: Option<&str>) {
        let mut card = format!("{key:<8}= {value:>20}");
        if let Some(c) = comment {
            card.push_str(" / ");
            card.push_str(c);
        }
        self.cards.push(card);
    }

    pub fn logical(&mut self, key: &str, value: bool, comment: Option<&str>) -> &mut Self {
        self.push_value(key, if value { "T" } else { "F" }, comment);
        self
    }

    pub fn integer(&mut self, key: &str, value: i64, comment: Option<&str>) -> &mut Self {
        self.push_value(key, &value.to_string(), comment);
        self
    }

    pub fn float(&mut self, key: &str, value: f64, comment: Option<&str>) -> &mut Self {
        self.push_value(key, &format!("{value:.9E}"), comment);
        self
    }

    pub fn string(&mut self, key: &str, value: &str, comment: Option<&str>) -> &mut Self {
        let quoted = format!("'{:<8}'", value.replace('\'', "''"));
        let mut card = format!("{key:<8}= {quoted:<20}");
        if let Some(c) = comment {
            card.push_str(" / ");
            card.push_str(c);
        }
        self.cards.push(card);
        self
    }

    /// Adds COMMENT cards, wrapping long text.
    pub fn comment(&mut self, text: &str) -> &mut Self {
        let chars: Vec<char> = text.chars().filter(|c| c.is_ascii() && !c.is_control()).collect();
        for chunk in chars.chunks(CARD_SIZE - 8) {
            let line: String = chunk.iter().collect();
            self.cards.push(format!("COMMENT {line}"));
        }
        self
    }

    /// Serializes the header with its END card, padded to whole blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        for card in self.cards.iter().map(String::as_str).chain(["END"]) {
            let mut bytes: Vec<u8> = card.bytes().take(CARD_SIZE).collect();
            bytes.resize(CARD_SIZE, b' ');
            out.extend_from_slice(&bytes);
        }
        pad_block(&mut out, b' ');
        out
    }
}

fn pad_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % BLOCK_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK_SIZE - rem, fill);
    }
}

fn bitpix(pixels: &Pixels) -> i64 {
    match pixels {
        Pixels::U8(_) => 8,
        Pixels::U16(_) => 16,
    }
}

fn image_header(frame: &Frame, depth: Option<usize>, meta: &Meta) -> Header {
    let mut hdr = Header::new();
    hdr.logical("SIMPLE", true, Some("conforms to FITS standard"))
        .integer("BITPIX", bitpix(frame.pixels()), Some("array data type"))
        .integer("NAXIS", if depth.is_some() { 3 } else { 2 }, None)
        .integer("NAXIS1", frame.width().into(), None)
        .integer("NAXIS2", frame.height().into(), None);
    if let Some(depth) = depth {
        hdr.integer("NAXIS3", depth as i64, None);
    }
    if let Pixels::U16(_) = frame.pixels() {
        hdr.integer("BZERO", 32768, Some("offset data range to that of unsigned short"))
            .integer("BSCALE", 1, Some("default scaling factor"));
    }
    hdr.integer("FRAMEID", frame.frame_id as i64, None)
        .string(
            "UNIXTIME",
            &format!(
                "{}.{:09}",
                frame.timestamp.seconds(),
                frame.timestamp.subsec(9)
            ),
            Some("host time of arrival"),
        );
    if let Some(exp) = meta.exposure_ms {
        hdr.float("EXPTIME", exp / 1000.0, Some("exposure time [s]"));
    }
    if let Some(t) = meta.temperature {
        hdr.float("CCD-TEMP", t, Some("detector temperature [C]"));
    }
    if let Some(c) = &meta.comment {
        hdr.comment(c);
    }
    hdr
}

fn append_pixels(out: &mut Vec<u8>, pixels: &Pixels) {
    match pixels {
        Pixels::U8(p) => out.extend_from_slice(p),
        Pixels::U16(p) => {
            out.reserve(p.len() * 2);
            for &v in p {
                out.extend_from_slice(&((v ^ 0x8000) as i16).to_be_bytes());
            }
        }
    }
}

/// Encodes a single frame as a complete FITS file.
pub fn encode(frame: &Frame, meta: &Meta) -> Vec<u8> {
    let mut out = image_header(frame, None, meta).to_bytes();
    append_pixels(&mut out, frame.pixels());
    pad_block(&mut out, 0);
    out
}

/// Encodes frames of identical geometry and depth as a data cube.
pub fn encode_cube(frames: &[Frame], meta: &Meta) -> Result<Vec<u8>> {
    let first = frames
        .first()
        .ok_or_else(|| Error::InvalidArgument("empty data cube".to_owned()))?;
    for f in frames {
        if f.width() != first.width()
            || f.height() != first.height()
            || f.pixel_format() != first.pixel_format()
        {
            return Err(Error::InvalidArgument(format!(
                "frame {} does not match cube geometry of frame {}",
                f, first
            )));
        }
    }

    let mut out = image_header(first, Some(frames.len()), meta).to_bytes();
    for f in frames {
        append_pixels(&mut out, f.pixels());
    }
    pad_block(&mut out, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_block_aligned() {
        let mut hdr = Header::new();
        hdr.logical("SIMPLE", true, None).integer("NAXIS", 0, None);
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert!(bytes.starts_with(format!("SIMPLE  = {:>20}", "T").as_bytes()));
        assert_eq!(&bytes[160..163], b"END");
    }

    #[test]
    fn unsigned_samples_use_bzero() {
        let frame = Frame::new(2, 1, Pixels::U16(vec![0, 65535]), 0);
        let bytes = encode(&frame, &Meta::default());
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
        let text = String::from_utf8_lossy(&bytes[..BLOCK_SIZE]);
        assert!(text.contains(&format!("BZERO   = {:>20}", 32768)));
        assert_eq!(&bytes[BLOCK_SIZE..BLOCK_SIZE + 4], &[0x80, 0x00, 0x7f, 0xff]);
    }

    #[test]
    fn cube_rejects_mixed_geometry() {
        let a = Frame::new(2, 2, Pixels::U16(vec![0; 4]), 0);
        let b = Frame::new(1, 4, Pixels::U16(vec![0; 4]), 1);
        assert!(encode_cube(&[a.clone(), b], &Meta::default()).is_err());
        assert!(encode_cube(&[], &Meta::default()).is_err());

        let cube = encode_cube(&[a.clone(), a], &Meta::default()).unwrap();
        let text = String::from_utf8_lossy(&cube[..BLOCK_SIZE]);
        assert!(text.contains(&format!("NAXIS3  = {:>20}", 2)));
    }

    #[test]
    fn float_cards_keep_a_mantissa() {
        let mut hdr = Header::new();
        hdr.float("EXPTIME", 0.1, None).float("CCD-TEMP", -60.0, None);
        assert_eq!(hdr.cards[0], format!("EXPTIME = {:>20}", "1.000000000E-1"));
        assert_eq!(hdr.cards[1], format!("CCD-TEMP= {:>20}", "-6.000000000E1"));
    }

    #[test]
    fn long_comments_wrap() {
        let mut hdr = Header::new();
        hdr.comment(&"x".repeat(100));
        assert_eq!(hdr.cards.len(), 2);
    }
}
