// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use serial_test::serial;
use std::{error::Error, time::Duration};
use tao_camera::{
    error,
    frame::PixelFormat,
    genicam::{
        self, features_to_json, nodes, AccessMode, AcquireOptions, AcquisitionMode, Camera,
        ImageFormatConfig, Naming, NodeMap, NodeMapExt, System,
    },
    save::SaveOptions,
    sim::{SimNodeMap, SimSystem},
};

fn system(cameras: usize) -> std::sync::Arc<SimSystem> {
    let system = SimSystem::instance();
    system.set_camera_count(cameras);
    system
}

#[test]
#[serial]
fn test_select_camera() -> Result<(), Box<dyn Error>> {
    let sys = system(2);
    assert_eq!(sys.interfaces()?[0].cameras, 2);
    let mut camera = genicam::select_camera(sys.as_ref(), 1)?;
    assert_eq!(camera.serial()?, "19000001");

    assert!(matches!(
        genicam::select_camera(sys.as_ref(), 2),
        Err(error::Error::CameraIndex { index: 2, count: 2 })
    ));

    sys.set_camera_count(0);
    assert!(matches!(
        genicam::select_camera(sys.as_ref(), 0),
        Err(error::Error::NoCamera)
    ));
    assert!(matches!(
        genicam::check_camera(sys.as_ref(), 0),
        Err(error::Error::NoCamera)
    ));
    Ok(())
}

#[test]
#[serial]
fn test_check_camera() -> Result<(), Box<dyn Error>> {
    let sys = system(1);
    genicam::check_camera(sys.as_ref(), 0)?;
    Ok(())
}

#[test]
#[serial]
fn test_node_map_requires_init() -> Result<(), Box<dyn Error>> {
    let sys = system(1);
    let mut camera = genicam::select_camera(sys.as_ref(), 0)?;
    assert!(matches!(
        camera.node_map(),
        Err(error::Error::NotInitialized)
    ));
    // Transport maps are usable before init.
    let features = camera.tl_device_node_map().dump_category(nodes::ROOT)?;
    assert_eq!(features[0].name, "DeviceInformation");
    assert_eq!(features[0].depth, 0);
    assert!(features
        .iter()
        .any(|f| f.name == nodes::DEVICE_SERIAL_NUMBER && f.value.as_deref() == Some("19000000")));

    let json = features_to_json(&features);
    assert_eq!(json["DeviceInformation"]["DeviceID"], "sim-0");
    Ok(())
}

#[test]
fn test_dump_marks_unreadable_nodes() -> Result<(), Box<dyn Error>> {
    let mut map = SimNodeMap::new();
    map.add_category(nodes::ROOT, &["Info", "Secret", "Missing"])
        .add_category("Info", &["Model"])
        .add_string("Model", "X")
        .add_string("Secret", "hidden");
    map.set_access("Secret", AccessMode::WriteOnly)?;

    let features = map.dump_category(nodes::ROOT)?;
    let lines: Vec<String> = features.iter().map(|f| f.to_string()).collect();
    assert_eq!(
        lines,
        vec![
            "Info".to_owned(),
            "    Model: X".to_owned(),
            format!("Secret: {}", genicam::NOT_READABLE),
        ]
    );

    let json = features_to_json(&features);
    assert_eq!(json["Info"]["Model"], "X");
    assert!(json["Secret"].is_null());
    Ok(())
}

#[test]
#[serial]
fn test_acquire_continuous() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sys = system(1);
    let mut camera = genicam::select_camera(sys.as_ref(), 0)?;
    camera.init()?;

    let opts = AcquireOptions {
        mode: AcquisitionMode::Continuous,
        count: 3,
        ..AcquireOptions::default()
    };
    let files = genicam::acquire_images(camera.as_mut(), &opts, dir.path())?;
    assert_eq!(files.len(), 3);
    for (n, path) in files.iter().enumerate() {
        assert_eq!(
            path.file_name().and_then(|f| f.to_str()),
            Some(format!("Acquisition-Continuous-{n}.jpg").as_str())
        );
        assert!(path.exists());
    }

    let opts = AcquireOptions {
        count: 5,
        ..AcquireOptions::default()
    };
    let files = genicam::acquire_images(camera.as_mut(), &opts, dir.path())?;
    assert_eq!(files, vec![dir.path().join("Acquisition_SingleFrame.jpg")]);

    let opts = AcquireOptions {
        mode: AcquisitionMode::Continuous,
        count: 2,
        naming: Naming::Serial,
        save: SaveOptions::default(),
        ..AcquireOptions::default()
    };
    let files = genicam::acquire_images(camera.as_mut(), &opts, dir.path())?;
    assert_eq!(files[1], dir.path().join("Acquisition-19000000-1.fits"));

    camera.deinit()?;
    Ok(())
}

#[test]
#[serial]
fn test_incomplete_images_are_skipped() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let sys = system(1);
    let mut camera = sys.camera(0)?.with_incomplete_every(2);
    camera.init()?;
    let opts = AcquireOptions {
        mode: AcquisitionMode::Continuous,
        count: 4,
        ..AcquireOptions::default()
    };
    let files = genicam::acquire_images(&mut camera, &opts, dir.path())?;
    assert_eq!(files.len(), 2);
    camera.deinit()?;
    Ok(())
}

#[test]
#[serial]
fn test_exposure_is_capped() -> Result<(), Box<dyn Error>> {
    let sys = system(1);
    let mut camera = sys.camera(0)?;
    camera.init()?;
    let map = camera.node_map()?;

    // Automatic exposure keeps the time read-only.
    assert!(!map.is_writable(nodes::EXPOSURE_TIME));
    let applied = genicam::configure_exposure(map, 2_000_000.0)?;
    assert_eq!(applied, 1_000_000.0);
    assert_eq!(map.float(nodes::EXPOSURE_TIME)?, 1_000_000.0);
    assert_eq!(map.enum_current(nodes::EXPOSURE_AUTO)?.symbolic, "Off");

    genicam::reset_exposure(map)?;
    assert_eq!(map.enum_current(nodes::EXPOSURE_AUTO)?.symbolic, "Continuous");
    assert!(!map.is_writable(nodes::EXPOSURE_TIME));

    let fps = genicam::set_frame_rate(map, 1000.0)?;
    assert_eq!(fps, 120.0);
    camera.deinit()?;
    Ok(())
}

#[test]
#[serial]
fn test_image_format() -> Result<(), Box<dyn Error>> {
    let sys = system(1);
    let mut camera = sys.camera(0)?;
    camera.init()?;

    let cfg = ImageFormatConfig {
        pixel_format: Some("Mono16".to_owned()),
        width: Some(320),
        height: Some(100_000),
        offset_x: Some(1000),
        offset_y: Some(0),
        reverse_x: Some(true),
        ..ImageFormatConfig::default()
    };
    let applied = genicam::configure_image_format(camera.node_map()?, &cfg)?;
    assert_eq!(applied.width, Some(320));
    assert_eq!(applied.height, Some(480));
    assert_eq!(applied.offset_x, Some(320));
    assert_eq!(applied.offset_y, Some(0));

    camera.begin_acquisition()?;
    let frame = camera.next_image(Duration::from_secs(1))?;
    camera.end_acquisition()?;
    assert_eq!((frame.width(), frame.height()), (320, 480));
    assert_eq!(frame.pixel_format(), PixelFormat::Mono16);

    let bad = ImageFormatConfig {
        pixel_format: Some("RGB8".to_owned()),
        ..ImageFormatConfig::default()
    };
    assert!(matches!(
        genicam::configure_image_format(camera.node_map()?, &bad),
        Err(error::Error::NoSuchEntry { .. })
    ));
    camera.deinit()?;
    Ok(())
}

#[test]
#[serial]
fn test_single_frame_times_out_after_first_image() -> Result<(), Box<dyn Error>> {
    let sys = system(1);
    let mut camera = sys.camera(0)?;
    camera.init()?;
    camera
        .node_map()?
        .set_enum_by_name(nodes::ACQUISITION_MODE, "SingleFrame")?;
    camera.begin_acquisition()?;
    camera.next_image(Duration::from_millis(10))?;
    assert!(matches!(
        camera.next_image(Duration::from_millis(10)),
        Err(error::Error::Timeout(_))
    ));
    camera.end_acquisition()?;

    genicam::device_reset(camera.node_map()?)?;
    assert_eq!(camera.sim_node_map().executed(), [nodes::DEVICE_RESET]);
    camera.deinit()?;
    Ok(())
}
