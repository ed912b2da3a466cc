// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::Result,
    image::{self, Conversion, Format, Image},
    frame::Frame,
};
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

struct Slot {
    image: Image,
    generation: u64,
}

/// Frame buffer shared between the acquisition thread and the display.
///
/// The image is allocated once and only reachable through the mutex guard.
/// Each publish bumps a generation counter and wakes waiters on the
/// condition variable, so readers can tell fresh data from stale data.
pub struct SharedFrameBuffer {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl SharedFrameBuffer {
    pub fn new(width: u32, height: u32, format: Format) -> Self {
        Self {
            slot: Mutex::new(Slot {
                image: Image::new(width, height, format),
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panicking writer leaves whole pixels behind; keep serving them.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.lock().image.width()
    }

    pub fn height(&self) -> u32 {
        self.lock().image.height()
    }

    pub fn format(&self) -> Format {
        self.lock().image.format()
    }

    /// Number of frames published so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Converts `frame` into the buffer under the lock and notifies waiters.
    /// Returns the new generation.
    pub fn publish(&self, frame: &Frame, conv: Conversion) -> Result<u64> {
        let mut slot = self.lock();
        image::convert(frame, &mut slot.image, conv)?;
        slot.generation += 1;
        let generation = slot.generation;
        drop(slot);
        self.cond.notify_all();
        Ok(generation)
    }

    /// Copies the buffer into `dst` when it is newer than `seen`. Returns
    /// the current generation either way; never blocks on the producer.
    pub fn copy_if_newer(&self, dst: &mut Image, seen: u64) -> Result<u64> {
        let slot = self.lock();
        if slot.generation != seen {
            dst.copy_from(&slot.image)?;
        }
        Ok(slot.generation)
    }

    /// Waits up to `timeout` for a generation after `seen`, then copies it
    /// into `dst`. Returns `None` on timeout.
    pub fn wait_newer(&self, dst: &mut Image, seen: u64, timeout: Duration) -> Result<Option<u64>> {
        let slot = self.lock();
        let (slot, res) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.generation == seen)
            .unwrap_or_else(|e| e.into_inner());
        if res.timed_out() {
            return Ok(None);
        }
        dst.copy_from(&slot.image)?;
        Ok(Some(slot.generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Pixels;
    use std::{sync::Arc, thread};

    fn frame(v: u16) -> Frame {
        Frame::new(4, 2, Pixels::U16(vec![v; 8]), 0)
    }

    #[test]
    fn stale_copy_is_skipped() {
        let buf = SharedFrameBuffer::new(4, 2, Format::Gray8);
        let mut dst = Image::new(4, 2, Format::Gray8);
        assert_eq!(buf.copy_if_newer(&mut dst, 0).unwrap(), 0);

        buf.publish(&frame(u16::MAX), Conversion::Gray8).unwrap();
        assert_eq!(buf.copy_if_newer(&mut dst, 0).unwrap(), 1);
        assert_eq!(dst.pixel(0, 0), 254);
    }

    #[test]
    fn waiter_wakes_on_publish() {
        let buf = Arc::new(SharedFrameBuffer::new(4, 2, Format::Gray8));
        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buf.publish(&frame(0), Conversion::Gray8Inverted).unwrap();
            })
        };
        let mut dst = Image::new(4, 2, Format::Gray8);
        let gen = buf
            .wait_newer(&mut dst, 0, Duration::from_secs(5))
            .unwrap();
        producer.join().unwrap();
        assert_eq!(gen, Some(1));
        assert_eq!(dst.pixel(3, 1), 255);
    }

    #[test]
    fn wait_times_out_without_producer() {
        let buf = SharedFrameBuffer::new(4, 2, Format::Gray8);
        let mut dst = Image::new(4, 2, Format::Gray8);
        let res = buf
            .wait_newer(&mut dst, 0, Duration::from_millis(10))
            .unwrap();
        assert_eq!(res, None);
    }
}
