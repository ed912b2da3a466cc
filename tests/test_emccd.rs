// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{error::Error, fs, path::Path};
use tao_camera::{
    acquisition::{self, Clock, TimedOptions},
    emccd::{
        self, programs, CropMode, EmccdCamera, ProcType, ShutterMode, TimestampMode,
        TIMEOUT_MARGIN_MS,
    },
    error,
    save::SaveOptions,
    sim::SimEmccd,
};

fn camera() -> Result<SimEmccd, Box<dyn Error>> {
    let mut cam = SimEmccd::builder().build();
    emccd::initialize(&mut cam, None)?;
    Ok(cam)
}

fn header(path: &Path) -> Result<String, Box<dyn Error>> {
    let bytes = fs::read(path)?;
    assert_eq!(bytes.len() % 2880, 0);
    Ok(String::from_utf8_lossy(&bytes[..2880]).into_owned())
}

fn card(key: &str, value: i64) -> String {
    format!("{key:<8}= {value:>20}")
}

fn frame_id(path: &Path) -> Result<i64, Box<dyn Error>> {
    let hdr = header(path)?;
    let start = hdr.find("FRAMEID = ").ok_or("no FRAMEID card")?;
    Ok(hdr[start + 10..start + 30].trim().parse()?)
}

fn names(files: &[std::path::PathBuf]) -> Vec<String> {
    files
        .iter()
        .filter_map(|p| p.file_name().and_then(|f| f.to_str()).map(str::to_owned))
        .collect()
}

#[test]
fn test_initialize() -> Result<(), Box<dyn Error>> {
    let mut cam = SimEmccd::builder().build();
    let timing = emccd::initialize(&mut cam, None)?;
    assert_eq!(cam.current_readout_mode()?, 1);
    assert_eq!(timing.exposure_ms, timing.readout_ms);
    assert!((timing.waiting_ms - timing.exposure_ms / 10.0).abs() < 1e-9);
    assert_eq!(
        timing.timeout_ms,
        (timing.waiting_ms + timing.readout_ms + timing.exposure_ms) as i32 + TIMEOUT_MARGIN_MS
    );

    let timing = emccd::initialize(&mut cam, Some(50.0))?;
    assert_eq!(cam.exposure_time()?, 50.0);
    assert_eq!(cam.waiting_time()?, 5.0);
    assert_eq!(timing.timeout_ms, cam.timeout()?);
    Ok(())
}

#[test]
fn test_em_gain_selection() -> Result<(), Box<dyn Error>> {
    assert_eq!(emccd::em_gain_median(1, 5000, Some(10)), 2500);
    assert_eq!(emccd::em_gain_requested(1, 5000, Some(10)), 10);
    assert_eq!(emccd::em_gain_requested(1, 5000, Some(9000)), 5000);
    assert_eq!(emccd::em_gain_requested(1, 5000, None), 2500);

    let mut cam = camera()?;
    assert_eq!(
        emccd::set_em_gain(&mut cam, emccd::em_gain_requested, Some(300))?,
        Some(300)
    );
    assert_eq!(cam.calibrated_em_gain()?, 300);

    // Conventional amplifier has no EM gain.
    cam.set_readout_mode(3)?;
    assert_eq!(
        emccd::set_em_gain(&mut cam, emccd::em_gain_median, None)?,
        None
    );
    Ok(())
}

#[test]
fn test_clamped_settings() -> Result<(), Box<dyn Error>> {
    let mut cam = camera()?;
    assert_eq!(emccd::set_analog_gain(&mut cam, 0)?, 1);
    assert_eq!(emccd::set_analog_offset(&mut cam, 10_000)?, 4095);
    assert_eq!(emccd::set_temperature(&mut cam, 0.0)?, -40.0);

    let mut cam = SimEmccd::builder().calibrated_em_gain(false).build();
    assert_eq!(emccd::set_temperature(&mut cam, -120.0)?, -85.0);
    assert_eq!(emccd::set_temperature(&mut cam, 0.0)?, 0.0);

    let roi = emccd::set_roi(&mut cam, 2000, 100)?;
    assert_eq!((roi.x, roi.y, roi.width, roi.height), (0, 206, 512, 100));
    assert_eq!(cam.size()?, (512, 100));
    Ok(())
}

#[test]
fn test_continuous() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let files = programs::continuous(&mut cam, dir.path(), 3, &SaveOptions::default())?;
    assert_eq!(names(&files), ["Image_0.fits", "Image_1.fits", "Image_2.fits"]);
    assert_eq!(cam.shutter_mode()?, ShutterMode::Close);
    assert!(!cam.is_acquiring()?);

    let hdr = header(&files[0])?;
    assert!(hdr.starts_with("SIMPLE  ="));
    assert!(hdr.contains(&card("NAXIS1", 512)));
    assert!(hdr.contains(&card("BZERO", 32768)));
    assert!(hdr.contains("COMMENT Image acquired in continuous acquisition"));
    Ok(())
}

#[test]
fn test_no_overwrite() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let save = SaveOptions {
        overwrite: false,
        ..SaveOptions::default()
    };
    programs::continuous(&mut cam, dir.path(), 1, &save)?;
    let res = programs::continuous(&mut cam, dir.path(), 1, &save);
    assert!(matches!(res, Err(error::Error::FileExists { .. })));
    // Shutter is closed on the failure path too.
    assert_eq!(cam.shutter_mode()?, ShutterMode::Close);
    Ok(())
}

#[test]
fn test_timed() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let period = cam.framerate()?.recip() * 1000.0;
    let stamps = programs::timed(&mut cam, dir.path(), 3, &SaveOptions::jpeg())?;
    assert_eq!(stamps.len(), 3);
    assert_eq!(names(&[stamps[2].0.clone()]), ["Image_2.jpg"]);
    for pair in stamps.windows(2) {
        assert!((pair[1].1 - pair[0].1 - period).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_internal_timestamp() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let report = programs::internal_timestamp(&mut cam, dir.path(), 4, &SaveOptions::default())?;
    assert_eq!(report.timestamps.len(), 4);
    assert_eq!(report.dropped, 0);

    let mut cam = SimEmccd::builder().ctrl_timestamp(false).build();
    emccd::initialize(&mut cam, None)?;
    let res = programs::internal_timestamp(&mut cam, dir.path(), 1, &SaveOptions::default());
    assert!(res.is_err_and(|e| e.is_not_present()));
    Ok(())
}

#[test]
fn test_internal_timestamp_reports_losses() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = SimEmccd::builder().overrun_every(2).build();
    emccd::initialize(&mut cam, None)?;
    let report = programs::internal_timestamp(&mut cam, dir.path(), 4, &SaveOptions::default())?;
    assert_eq!(report.dropped, 2);
    Ok(())
}

#[test]
fn test_callback() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let path = programs::callback(&mut cam, dir.path(), &SaveOptions::default())?;
    assert_eq!(path, dir.path().join("callbackImage.fits"));
    assert!(header(&path)?.contains("COMMENT This is an image grabbed from a callback function"));
    Ok(())
}

#[test]
fn test_temperature_header() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let path = programs::save_with_temperature(&mut cam, dir.path())?;
    assert_eq!(path, dir.path().join("newImage.fits"));
    let hdr = header(&path)?;
    assert!(hdr.contains("CCD-TEMP= "));
    assert!(hdr.contains("EXPTIME = "));
    Ok(())
}

#[test]
fn test_data_cubes() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let files = programs::data_cubes(&mut cam, dir.path(), 15, 5, &SaveOptions::default())?;
    assert_eq!(
        names(&files),
        ["DataCube_0.fits", "DataCube_1.fits", "DataCube_2.fits"]
    );
    let hdr = header(&files[2])?;
    assert!(hdr.contains(&card("NAXIS", 3)));
    assert!(hdr.contains(&card("NAXIS3", 5)));
    // 512 x 512 x 5 samples of two bytes after one header block.
    let len = fs::metadata(&files[0])?.len();
    assert!(len >= 2880 + 512 * 512 * 5 * 2);

    // A trailing partial cube is still written.
    let files = programs::data_cubes(&mut cam, dir.path(), 7, 5, &SaveOptions::jpeg())?;
    assert_eq!(files.len(), 2);
    assert!(header(&files[1])?.contains(&card("NAXIS3", 2)));

    assert!(programs::data_cubes(&mut cam, dir.path(), 5, 0, &SaveOptions::default()).is_err());
    Ok(())
}

#[test]
fn test_readout_modes() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let files = programs::readout_modes(&mut cam, dir.path(), &SaveOptions::default())?;
    assert_eq!(
        names(&files),
        [
            "readout_mode_1.fits",
            "readout_mode_2.fits",
            "readout_mode_3.fits",
            "readout_mode_4.fits"
        ]
    );
    assert_eq!(cam.current_readout_mode()?, 4);
    Ok(())
}

#[test]
fn test_bin_and_roi() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let files = programs::bin_and_roi(&mut cam, dir.path(), &SaveOptions::default())?;
    assert_eq!(
        names(&files),
        [
            "Image-Full.fits",
            "X-1_Y-2_binning.fits",
            "X-2_Y-1_binning.fits",
            "X-4_Y-1_binning.fits",
            "X-8_Y-1_binning.fits",
            "Image-ROI.fits"
        ]
    );
    assert!(header(&files[1])?.contains(&card("NAXIS2", 256)));
    assert!(header(&files[4])?.contains(&card("NAXIS1", 64)));
    assert!(header(&files[5])?.contains(&card("NAXIS1", 64)));
    assert_eq!(cam.binning()?, (1, 1));
    assert_eq!(cam.size()?, (512, 512));
    Ok(())
}

#[test]
fn test_gains_offsets_temperature() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let (report, files) =
        programs::gains_offsets_temperature(&mut cam, dir.path(), &SaveOptions::default())?;
    assert_eq!(names(&files), ["ReferenceImage.fits", "NewSettingsImage.fits"]);
    assert_eq!(report.target_temperature, -62.5);
    assert_eq!(report.calibrated_em_gain, Some(2500));
    assert_eq!(report.analog_gain, 3);
    assert_eq!(report.analog_offset, 2047);
    let json = report.to_json();
    assert_eq!(json["analog_offset"], 2047);
    assert!(report.to_string().contains("Calibrated EM gain: 2500"));

    let mut cam = SimEmccd::builder().calibrated_em_gain(false).build();
    emccd::initialize(&mut cam, None)?;
    let (report, _) =
        programs::gains_offsets_temperature(&mut cam, dir.path(), &SaveOptions::default())?;
    assert_eq!(report.target_temperature, -32.5);
    assert_eq!(report.calibrated_em_gain, None);
    assert_eq!(report.raw_em_gain, Some(2047));
    assert!(report.to_json()["calibrated_em_gain"].is_null());
    Ok(())
}

#[test]
fn test_processing_automatic() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    assert!(cam.set_proc_type(ProcType::Lm, 0).is_err());
    let files = programs::processing_automatic(&mut cam, dir.path(), 5, &SaveOptions::default())?;
    assert_eq!(names(&files), ["imageInLM.fits", "imageInPC.fits"]);
    assert!(header(&files[1])?.contains("COMMENT This is an image in photon counting"));
    Ok(())
}

#[test]
fn test_processing_manual() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let timeout = cam.timeout()?;
    let files = programs::processing_manual(&mut cam, dir.path(), 5, 3, &SaveOptions::default())?;
    assert_eq!(
        names(&files),
        ["ncImage.fits", "ncLmImage.fits", "ncPcImage.fits"]
    );
    assert!(header(&files[2])?.contains("COMMENT PC-Processed image"));
    assert_eq!(cam.timeout()?, timeout);
    Ok(())
}

#[test]
fn test_timed_loop() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    cam.set_exposure_time(0.0)?;
    cam.set_waiting_time(0.0)?;
    let period = cam.readout_time()?;
    let opts = TimedOptions {
        images: 20,
        warmup: 3,
        ..TimedOptions::default()
    };
    let res = acquisition::timed_loop(&mut cam, dir.path(), &opts)?;
    assert_eq!(res.clock, Clock::Controller);
    assert_eq!(res.overruns, 0);
    assert_eq!(res.dropped, None);
    assert!((res.ms_per_image - period).abs() < 1e-3);
    // Every image from -3 to 20 is written.
    assert_eq!(res.saved, 24);
    let on_disk = fs::read_dir(dir.path())?.count();
    assert_eq!(on_disk, 10);
    // The ten files hold the last ten images, 11 to 20.
    let first = frame_id(&dir.path().join("Image_1.fits"))?;
    for k in 2..10 {
        let id = frame_id(&dir.path().join(format!("Image_{k}.fits")))?;
        assert_eq!(id, first + k - 1);
    }
    assert_eq!(frame_id(&dir.path().join("Image_0.fits"))?, first + 9);

    let opts = TimedOptions {
        images: 0,
        ..TimedOptions::default()
    };
    assert!(acquisition::timed_loop(&mut cam, dir.path(), &opts).is_err());
    Ok(())
}

#[test]
fn test_timed_loop_reports_writer_failure() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    // The first image, index -2, would replace this file.
    fs::write(dir.path().join("Image_2.fits"), b"keep")?;
    let mut cam = camera()?;
    cam.set_exposure_time(0.0)?;
    cam.set_waiting_time(0.0)?;
    let opts = TimedOptions {
        images: 40,
        warmup: 2,
        save: Some(SaveOptions {
            overwrite: false,
            ..SaveOptions::default()
        }),
        ..TimedOptions::default()
    };
    let res = acquisition::timed_loop(&mut cam, dir.path(), &opts);
    assert!(matches!(res, Err(error::Error::FileExists { .. })));
    assert_eq!(fs::read(dir.path().join("Image_2.fits"))?, b"keep");
    assert!(!cam.is_acquiring()?);
    assert_eq!(cam.shutter_mode()?, ShutterMode::Close);

    // A failed read is reported ahead of the writer's outcome.
    cam.set_exposure_time(50.0)?;
    cam.set_timeout(1)?;
    let res = acquisition::timed_loop(&mut cam, dir.path(), &opts);
    assert!(matches!(res, Err(error::Error::Timeout(_))));
    Ok(())
}

#[test]
fn test_timed_loop_falls_back_to_host_clock() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = SimEmccd::builder()
        .timestamp_fail_after(5)
        .overrun_every(4)
        .build();
    emccd::initialize(&mut cam, None)?;
    let opts = TimedOptions {
        images: 10,
        warmup: 2,
        save: None,
        ..TimedOptions::default()
    };
    let res = acquisition::timed_loop(&mut cam, dir.path(), &opts)?;
    assert_eq!(res.clock, Clock::Host);
    assert!(res.total_ms > 0.0);
    assert_eq!(res.saved, 0);
    assert_eq!(res.overruns, 3);
    assert_eq!(res.dropped, Some(3));

    let mut cam = SimEmccd::builder().ctrl_timestamp(false).build();
    emccd::initialize(&mut cam, None)?;
    let res = acquisition::timed_loop(&mut cam, dir.path(), &opts)?;
    assert_eq!(res.clock, Clock::Host);
    Ok(())
}

#[test]
fn test_maximize_framerate() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let mut cam = camera()?;
    let opts = TimedOptions {
        images: 20,
        warmup: 2,
        save: None,
        ..TimedOptions::default()
    };
    let table = programs::maximize_framerate(&mut cam, dir.path(), &opts)?;
    let modes: Vec<&str> = table.rows.iter().map(|r| r.mode).collect();
    assert_eq!(modes, ["Full", "Bin", "ROI", "Crop"]);
    assert_eq!(table.rows[0].speed_up, 1.0);
    for row in &table.rows[1..] {
        assert!(row.speed_up > 1.0, "{row:?}");
        assert!(row.acquisition_ms > 0.0);
    }
    assert!(table.to_string().starts_with("Mode\tReadout Time"));

    assert_eq!(cam.binning()?, (1, 1));
    assert_eq!(cam.size()?, (512, 512));
    assert_eq!(cam.crop_mode()?.mode, CropMode::Disabled);
    Ok(())
}

#[test]
fn test_timestamp_mode_requires_feature() -> Result<(), Box<dyn Error>> {
    let mut cam = SimEmccd::builder().ctrl_timestamp(false).build();
    assert!(cam.set_timestamp_mode(TimestampMode::None).is_ok());
    assert!(cam
        .set_timestamp_mode(TimestampMode::Internal)
        .is_err_and(|e| e.is_not_present()));
    Ok(())
}

#[test]
fn test_open_units() {
    assert!(SimEmccd::open(emccd::AUTO_UNIT, emccd::AUTO_CHANNEL, 4).is_ok());
    assert!(SimEmccd::open(0, 0, 4).is_ok());
    assert!(matches!(
        SimEmccd::open(1, 0, 4),
        Err(error::Error::NoCamera)
    ));
    assert!(matches!(
        SimEmccd::open(0, 0, 0),
        Err(error::Error::Vendor { code: -1, .. })
    ));
}
