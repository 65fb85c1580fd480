//! Device set construction helpers

use multicap_rs::devices::{
    BlitEngine, CaptureDevice, DisplayEngine, FileWriter, FormatConverter, RecordingWriter,
    SimBlitter, SimCaptureDevice, SimConverter, SimDisplay, SimDisplayProbe,
};
use multicap_rs::pipeline::DeviceSet;
use std::time::Duration;

/// Simulated devices plus handles for inspecting them afterwards
pub struct TestDevices {
    pub set: DeviceSet,
    pub writer: RecordingWriter,
    pub display: SimDisplayProbe,
}

/// Fast simulated devices; `customize` may replace the capture device of a
/// channel
pub fn test_devices(
    channels: usize,
    customize: impl Fn(u32, SimCaptureDevice) -> SimCaptureDevice,
) -> TestDevices {
    let writer = RecordingWriter::new();
    let display = SimDisplay::new();
    let probe = display.probe();
    TestDevices {
        set: DeviceSet {
            capture: (0..channels as u32)
                .map(|ch| {
                    let device = SimCaptureDevice::new(ch).with_frame_interval(Duration::from_millis(1));
                    Box::new(customize(ch, device)) as Box<dyn CaptureDevice>
                })
                .collect(),
            converters: (0..channels)
                .map(|_| Box::new(SimConverter::new()) as Box<dyn FormatConverter>)
                .collect(),
            writers: (0..channels)
                .map(|_| Box::new(writer.clone()) as Box<dyn FileWriter>)
                .collect(),
            blitter: Box::new(SimBlitter::new()) as Box<dyn BlitEngine>,
            display: Box::new(display) as Box<dyn DisplayEngine>,
        },
        writer,
        display: probe,
    }
}

/// Unmodified simulated devices
pub fn default_devices(channels: usize) -> TestDevices {
    test_devices(channels, |_, device| device)
}
