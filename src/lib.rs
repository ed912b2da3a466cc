// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # TAO Camera Library
//!
//! Control of scientific cameras for two families: GenICam machine-vision
//! cameras, driven through typed node maps, and low-light EMCCD cameras
//! with readout modes, EM gain, cooling and on-camera processing.
//!
//! ## Features
//!
//! - **Node access**: capability queries and capped integer, float,
//!   enumeration, boolean and command access over any [`genicam::NodeMap`].
//! - **EMCCD sessions**: the [`emccd::EmccdCamera`] trait with session
//!   helpers for timing, gains, temperature and regions of interest.
//! - **Acquisition**: timed loops with overrun accounting and a cancellable
//!   producer thread feeding a [`buffer::SharedFrameBuffer`].
//! - **Image output**: pixel depth conversion, rotation, FITS images and
//!   data cubes, and JPEG encoding using turbojpeg with SIMD.
//!
//! Vendor SDKs plug in behind the traits; the [`sim`] module provides a
//! simulated implementation of both families.
//!
//! ## Example
//!
//! ```no_run
//! use tao_camera::{emccd, save::SaveOptions, sim::SimEmccd};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cam = SimEmccd::builder().build();
//! emccd::initialize(&mut cam, Some(10.0))?;
//! let files = emccd::programs::continuous(
//!     &mut cam,
//!     std::path::Path::new("."),
//!     10,
//!     &SaveOptions::default(),
//! )?;
//! println!("saved {} images", files.len());
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod buffer;
pub mod display;
pub mod emccd;
pub mod error;
pub mod fits;
pub mod frame;
pub mod genicam;
pub mod image;
pub mod save;
pub mod sim;
