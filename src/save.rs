// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    fits,
    frame::Frame,
    image::{encode_jpeg, to_image, Conversion},
};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// On-disk image formats.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Fits,
    Jpeg,
}

impl ImageFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            ImageFormat::Fits => "fits",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Clone, Debug)]
pub struct SaveOptions {
    pub format: ImageFormat,
    /// Replace existing files instead of failing.
    pub overwrite: bool,
    /// JPEG quality, 1..=100.
    pub quality: i32,
    pub meta: fits::Meta,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Fits,
            overwrite: true,
            quality: 100,
            meta: fits::Meta::default(),
        }
    }
}

impl SaveOptions {
    pub fn jpeg() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            ..Self::default()
        }
    }

    /// Path for `name` in `dir` with the extension of the chosen format.
    pub fn path(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.{}", self.format.extension()))
    }
}

fn write_file(path: &Path, data: &[u8], overwrite: bool) -> Result<()> {
    if !overwrite && path.exists() {
        return Err(Error::FileExists {
            path: path.display().to_string(),
        });
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Saves one frame as `<dir>/<name>.<ext>` and returns the path written.
#[instrument(skip_all, fields(name = name))]
pub fn save_frame(frame: &Frame, dir: &Path, name: &str, opts: &SaveOptions) -> Result<PathBuf> {
    let path = opts.path(dir, name);
    let data = match opts.format {
        ImageFormat::Fits => fits::encode(frame, &opts.meta),
        ImageFormat::Jpeg => {
            let img = to_image(frame, Conversion::Gray8)?;
            encode_jpeg(&img, opts.quality)?.to_vec()
        }
    };
    write_file(&path, &data, opts.overwrite)?;
    debug!("saved {} to {}", frame, path.display());
    Ok(path)
}

/// Groups frames into FITS data cubes of a fixed depth.
///
/// Cubes are written as `<root>_<n>.fits` with `n` counting from zero. A
/// partially filled cube is written by [`CubeWriter::finish`].
pub struct CubeWriter {
    dir: PathBuf,
    root: String,
    depth: usize,
    opts: SaveOptions,
    pending: Vec<Frame>,
    written: Vec<PathBuf>,
}

impl CubeWriter {
    pub fn new(dir: &Path, root: &str, depth: usize, opts: SaveOptions) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidArgument(
                "data cube depth must be at least 1".to_owned(),
            ));
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            root: root.to_owned(),
            depth,
            opts: SaveOptions {
                format: ImageFormat::Fits,
                ..opts
            },
            pending: Vec::with_capacity(depth),
            written: Vec::new(),
        })
    }

    /// Adds a frame, writing the cube once it holds `depth` frames.
    pub fn push(&mut self, frame: Frame) -> Result<Option<PathBuf>> {
        self.pending.push(frame);
        if self.pending.len() < self.depth {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    fn flush(&mut self) -> Result<PathBuf> {
        let name = format!("{}_{}", self.root, self.written.len());
        let path = self.opts.path(&self.dir, &name);
        let data = fits::encode_cube(&self.pending, &self.opts.meta)?;
        write_file(&path, &data, self.opts.overwrite)?;
        info!("wrote {} images to {}", self.pending.len(), path.display());
        self.pending.clear();
        self.written.push(path.clone());
        Ok(path)
    }

    /// Writes any pending frames and returns every cube written.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        if !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(self.written)
    }
}
