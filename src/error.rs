// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{fmt, time::Duration};
use tracing::error;

pub type Result<T> = std::result::Result<T, Error>;

/// Camera SDK family that produced a status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sdk {
    /// GenICam machine-vision SDK.
    Genicam,
    /// Low-light EMCCD scientific camera SDK.
    Emccd,
}

impl fmt::Display for Sdk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sdk::Genicam => write!(f, "genicam"),
            Sdk::Emccd => write!(f, "emccd"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{sdk} call {func} failed with status {code}")]
    Vendor {
        sdk: Sdk,
        func: &'static str,
        code: i32,
    },
    #[error("node {0} does not exist")]
    NoSuchNode(String),
    #[error("node {node} is not {access}")]
    AccessDenied { node: String, access: &'static str },
    #[error("enumeration {node} has no entry {entry}")]
    NoSuchEntry { node: String, entry: String },
    #[error("node {node} has type {actual}, expected {expected}")]
    NodeType {
        node: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("feature not present: {0}")]
    FeatureNotPresent(String),
    #[error("no camera detected")]
    NoCamera,
    #[error("camera is not initialized")]
    NotInitialized,
    #[error("camera index {index} out of range ({count} detected)")]
    CameraIndex { index: usize, count: usize },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("image incomplete with status {0}")]
    IncompleteImage(i32),
    #[error("no timestamp attached to image")]
    NoTimestamp,
    #[error("acquisition is not running")]
    NotAcquiring,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),
    #[error("{0} thread stopped")]
    ThreadStopped(&'static str),
    #[error("{path} already exists")]
    FileExists { path: String },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("jpeg error: {source}")]
    Jpeg {
        #[from]
        source: turbojpeg::Error,
    },
    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

fn _test_error_is_send() {
    fn implements<T: Send + Sync>() {}
    implements::<Error>();
}

impl Error {
    pub fn vendor(sdk: Sdk, func: &'static str, code: i32) -> Self {
        Error::Vendor { sdk, func, code }
    }

    /// True for the errors a capability probe is expected to return when the
    /// camera simply lacks the feature.
    pub fn is_not_present(&self) -> bool {
        matches!(self, Error::FeatureNotPresent(_) | Error::NoSuchNode(_))
    }
}

/// Two-valued outcome of a camera call, as used for process exit codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn exit_code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
        }
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(res: &Result<T>) -> Self {
        match res {
            Ok(_) => Status::Ok,
            Err(_) => Status::Error,
        }
    }
}

/// Logs a failed call with its origin and passes the result through.
pub fn report<T>(func: &str, res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        error!("{func}: {e}");
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_result() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(Error::vendor(Sdk::Emccd, "open", -3));
        assert_eq!(Status::from(&ok), Status::Ok);
        assert_eq!(Status::from(&err), Status::Error);
        assert_eq!(Status::from(&ok).exit_code(), 0);
        assert_eq!(Status::from(&err).exit_code(), 1);
        assert_eq!(
            err.unwrap_err().to_string(),
            "emccd call open failed with status -3"
        );
    }

    #[test]
    fn missing_features() {
        assert!(Error::FeatureNotPresent("CalibratedEmGain".into()).is_not_present());
        assert!(Error::NoSuchNode("ReverseX".into()).is_not_present());
        assert!(!Error::NoCamera.is_not_present());
    }
}
