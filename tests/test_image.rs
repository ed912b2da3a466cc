// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::error::Error;
use tao_camera::{
    frame::{Frame, Pixels},
    image::{
        self, encode_jpeg, pack_rgb30, scale_to_u8, scale_to_u8_inverted, to_image, Conversion,
        Format, Image, Rotation,
    },
};

#[test]
fn test_formats() -> Result<(), Box<dyn Error>> {
    let img = Image::new(640, 480, Format::Gray8);
    println!("{}", img);
    assert_eq!(img.size(), 307200);

    let img = Image::new(640, 480, Format::Rgb30);
    println!("{}", img);
    assert_eq!(img.size(), 1228800);

    // Rows are padded to four bytes.
    let img = Image::new(3, 2, Format::Gray8);
    assert_eq!(img.stride(), 4);
    assert_eq!(img.size(), 8);
    let img = Image::new(3, 2, Format::Rgb30);
    assert_eq!(img.stride(), 12);

    Ok(())
}

#[test]
fn test_scaling() {
    assert_eq!(scale_to_u8(0), 0);
    assert_eq!(scale_to_u8(256), 0);
    assert_eq!(scale_to_u8(257), 0);
    assert_eq!(scale_to_u8(258), 1);
    assert_eq!(scale_to_u8(32768), 127);
    assert_eq!(scale_to_u8(u16::MAX), 254);
    assert_eq!(scale_to_u8_inverted(0), 255);
    assert_eq!(scale_to_u8_inverted(u16::MAX), 1);
    assert_eq!(pack_rgb30(0), 0);
    assert_eq!(pack_rgb30(u16::MAX), 0x3fff_ffff);
    assert_eq!(pack_rgb30(32768), (512 << 20) | (512 << 10) | 512);
}

#[test]
fn test_convert() -> Result<(), Box<dyn Error>> {
    let frame = Frame::new(3, 2, Pixels::U16(vec![0, 32768, 65535, 258, 256, 1000]), 0);

    let gray = to_image(&frame, Conversion::Gray8)?;
    assert_eq!(gray.to_gray8(), vec![0, 127, 254, 1, 0, 3]);

    let inverted = to_image(&frame, Conversion::Gray8Inverted)?;
    assert_eq!(inverted.pixel(0, 0), 255);
    assert_eq!(inverted.pixel(2, 0), 1);

    let rgb = to_image(&frame, Conversion::Rgb30)?;
    assert_eq!(rgb.format(), Format::Rgb30);
    assert_eq!(rgb.pixel(2, 0), 0x3fff_ffff);
    assert_eq!(rgb.to_gray8()[2], 255);

    Ok(())
}

#[test]
fn test_convert_widens_8bit() -> Result<(), Box<dyn Error>> {
    let frame = Frame::new(2, 1, Pixels::U8(vec![255, 128]), 0);
    let gray = to_image(&frame, Conversion::Gray8)?;
    assert_eq!(gray.to_gray8(), vec![254, 127]);
    Ok(())
}

#[test]
fn test_convert_geometry_mismatch() {
    let frame = Frame::new(2, 2, Pixels::U16(vec![0; 4]), 0);
    let mut dst = Image::new(4, 1, Format::Gray8);
    assert!(image::convert(&frame, &mut dst, Conversion::Gray8).is_err());
    let mut dst = Image::new(2, 2, Format::Gray8);
    assert!(image::convert(&frame, &mut dst, Conversion::Rgb30).is_err());
}

#[test]
fn test_convert_empty_frame() {
    for (w, h) in [(0, 2), (2, 0)] {
        let frame = Frame::new(w, h, Pixels::U16(Vec::new()), 0);
        assert!(matches!(
            to_image(&frame, Conversion::Gray8),
            Err(tao_camera::error::Error::InvalidArgument(_))
        ));
    }
}

#[test]
fn test_rotation() -> Result<(), Box<dyn Error>> {
    assert_eq!(Rotation::from_degrees(0)?, Rotation::Rotation0);
    assert_eq!(Rotation::from_degrees(450)?, Rotation::Rotation90);
    assert_eq!(Rotation::from_degrees(-180)?, Rotation::Rotation180);
    assert!(Rotation::from_degrees(30).is_err());

    // 0 1 2
    // 3 4 5
    let frame = Frame::new(3, 2, Pixels::U8(vec![0, 1, 2, 3, 4, 5]), 0);
    let img = to_image(&frame, Conversion::Gray8Inverted)?;
    let values = img.to_gray8();

    let r90 = img.rotate(Rotation::Rotation90);
    assert_eq!((r90.width(), r90.height()), (2, 3));
    assert_eq!(r90.pixel(1, 0), u32::from(values[0]));
    assert_eq!(r90.pixel(0, 0), u32::from(values[3]));

    let r180 = img.rotate(Rotation::Rotation180);
    assert_eq!(r180.pixel(0, 0), u32::from(values[5]));

    let r270 = img.rotate(Rotation::Rotation270);
    assert_eq!((r270.width(), r270.height()), (2, 3));
    assert_eq!(r270.pixel(0, 0), u32::from(values[2]));

    assert_eq!(img.rotate(Rotation::Rotation0), img);
    Ok(())
}

#[test]
fn test_jpeg() -> Result<(), Box<dyn Error>> {
    let frame = Frame::new(
        64,
        48,
        Pixels::U16((0..64 * 48).map(|v| (v * 21) as u16).collect()),
        0,
    );
    for conv in [Conversion::Gray8, Conversion::Rgb30] {
        let img = to_image(&frame, conv)?;
        let jpeg = encode_jpeg(&img, 90)?;
        assert!(jpeg.len() > 4);
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let decoded = turbojpeg::decompress(&jpeg, turbojpeg::PixelFormat::GRAY)?;
        assert_eq!((decoded.width, decoded.height), (64, 48));
    }
    Ok(())
}
