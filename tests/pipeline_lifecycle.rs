//! Integration tests for the pipeline lifecycle
//!
//! These tests run complete pipelines on simulated devices and check:
//! - Frame limits end the run cleanly
//! - A fatal stage error stops every stage
//! - Cancellation is prompt
//! - Every buffer is back in its home pool after teardown

mod common;

use common::builders::ConfigBuilder;
use common::mock_helpers::{default_devices, test_devices};
use common::test_timeout;
use multicap_rs::pipeline::{PipelineBuilder, StageRole};
use multicap_rs::types::{StageState, SurfaceFormat};
use serial_test::serial;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_frame_limit_ends_run_with_all_buffers_home() {
    let config = ConfigBuilder::new(2).display().save().frame_limit(5).build();
    let devices = default_devices(2);
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()), "run should end at the frame limit");
    let summary = pipeline.shutdown();

    assert!(summary.error.is_none(), "unexpected error: {:?}", summary.error);
    assert!(summary.conservation.is_balanced(), "{:?}", summary.conservation);
    assert!(summary.stages.iter().all(|s| s.state == StageState::Stopped));

    let mut per_channel: BTreeMap<u32, usize> = BTreeMap::new();
    for (_, record) in devices.writer.records() {
        *per_channel.entry(record.channel).or_default() += 1;
    }
    assert!(per_channel.values().all(|&n| n <= 5));
    assert!(per_channel.values().any(|&n| n == 5));
}

#[test]
#[serial]
fn test_stages_stop_downstream_first() {
    let config = ConfigBuilder::new(1).display().frame_limit(2).build();
    let devices = default_devices(1);
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()));
    let summary = pipeline.shutdown();

    let roles: Vec<StageRole> = summary.stages.iter().map(|s| s.role).collect();
    assert_eq!(
        roles,
        vec![StageRole::Display, StageRole::Composite, StageRole::Save, StageRole::Capture]
    );
}

#[test]
#[serial]
fn test_fatal_capture_error_cancels_every_stage() {
    let config = ConfigBuilder::new(2).display().build();
    let devices = test_devices(2, |ch, device| {
        if ch == 1 {
            device.with_failure_after(3)
        } else {
            device
        }
    });
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()), "failure should cancel the run");
    let summary = pipeline.shutdown();

    let error = summary.error.expect("run should report the capture failure");
    assert!(error.contains("capture-1"), "{error}");
    assert!(summary.conservation.is_balanced(), "{:?}", summary.conservation);
    assert!(summary.stages.iter().all(|s| s.state == StageState::Stopped));
    let failed = summary
        .stages
        .iter()
        .find(|s| s.name == "capture-1")
        .expect("capture-1 summary");
    assert_eq!(failed.stats.failures, 1);
}

#[test]
#[serial]
fn test_starved_pipeline_times_out_instead_of_hanging() {
    let config = ConfigBuilder::new(1).build();
    let devices = test_devices(1, |_, device| device.stalled());
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()));
    let summary = pipeline.shutdown();

    let error = summary.error.expect("stalled capture should be fatal");
    assert!(error.contains("no frame"), "{error}");
    assert!(summary.conservation.is_balanced());
}

#[test]
#[serial]
fn test_cancel_is_prompt() {
    let config = ConfigBuilder::new(3).display().save().build();
    let devices = default_devices(3);
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();
    let cancel = pipeline.cancel_token();

    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!pipeline.wait_timeout(Duration::ZERO), "nothing should have stopped the run yet");

    let started = Instant::now();
    cancel.cancel();
    let summary = pipeline.shutdown();

    assert!(started.elapsed() < Duration::from_secs(2), "shutdown took {:?}", started.elapsed());
    assert!(summary.error.is_none(), "unexpected error: {:?}", summary.error);
    assert!(summary.conservation.is_balanced(), "{:?}", summary.conservation);
    assert!(devices.display.flips() > 0);
    assert!(!devices.writer.records().is_empty());
}

#[test]
#[serial]
fn test_per_channel_order_and_cadence_preserved() {
    let config = ConfigBuilder::new(2).save().cadence(2, 1, 2).frame_limit(6).build();
    let devices = default_devices(2);
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()));
    let summary = pipeline.shutdown();
    assert!(summary.conservation.is_balanced());

    let mut sequences: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for (_, record) in devices.writer.records() {
        sequences.entry(record.channel).or_default().push(record.sequence);
    }
    let expected = [0, 1, 3, 4, 6, 7];
    for seen in sequences.values() {
        assert_eq!(seen.as_slice(), &expected[..seen.len()]);
    }
}

#[test]
#[serial]
fn test_display_without_conversion() {
    let mut config = ConfigBuilder::new(2).format(SurfaceFormat::Yuv422).display().frame_limit(3).build();
    for channel in &mut config.channels {
        channel.buffer_count = 12;
    }
    let devices = default_devices(2);
    let mut pipeline = PipelineBuilder::new(config).build(devices.set).unwrap();
    assert_eq!(pipeline.pools().len(), 3);

    pipeline.start().unwrap();
    assert!(pipeline.wait_timeout(test_timeout()));
    let summary = pipeline.shutdown();

    assert!(summary.error.is_none(), "unexpected error: {:?}", summary.error);
    assert!(summary.conservation.is_balanced(), "{:?}", summary.conservation);
}
