// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Simulated cameras for both families, used by the CLI when no vendor
//! backend is linked and by the tests.

pub mod emccd;
pub mod genicam;
pub mod pattern;

pub use emccd::{SimEmccd, SimEmccdBuilder};
pub use genicam::{SimCamera, SimNodeMap, SimSystem};
