//! Test data builders for creating test configurations

use multicap_rs::config::{CadenceConfig, ChannelConfig, PipelineConfig, TimeoutConfig};
use multicap_rs::types::SurfaceFormat;

/// Builder for small, fast pipeline configurations
pub struct ConfigBuilder {
    channels: usize,
    width: u32,
    height: u32,
    format: SurfaceFormat,
    cadence: CadenceConfig,
    display: bool,
    save: bool,
    timeout_ms: u64,
}

impl ConfigBuilder {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            width: 8,
            height: 4,
            format: SurfaceFormat::Raw8,
            cadence: CadenceConfig::default(),
            display: false,
            save: false,
            timeout_ms: 20,
        }
    }

    pub fn format(mut self, format: SurfaceFormat) -> Self {
        self.format = format;
        self
    }

    pub fn frame_limit(mut self, frames: u64) -> Self {
        self.cadence.frame_limit = Some(frames);
        self
    }

    pub fn cadence(mut self, skip: u64, wait: u64, burst: u64) -> Self {
        self.cadence.frames_to_skip = skip;
        self.cadence.frames_to_wait = wait;
        self.cadence.burst_length = burst;
        self
    }

    pub fn display(mut self) -> Self {
        self.display = true;
        self
    }

    pub fn save(mut self) -> Self {
        self.save = true;
        self
    }

    pub fn build(self) -> PipelineConfig {
        let mut config = PipelineConfig {
            channels: (0..self.channels)
                .map(|_| ChannelConfig {
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    cadence: self.cadence,
                    ..ChannelConfig::default()
                })
                .collect(),
            timeouts: TimeoutConfig::uniform(self.timeout_ms),
            ..PipelineConfig::default()
        };
        // Generous pool waits so a slow scheduler is not mistaken for exhaustion
        config.timeouts.priming_ms = 1000;
        config.display.enabled = self.display;
        config.save.enabled = self.save;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new(2).display().frame_limit(5).build();

        assert_eq!(config.channels.len(), 2);
        assert!(config.display.enabled);
        assert_eq!(config.channels[1].cadence.frame_limit, Some(5));
        assert!(config.validate().is_ok());
    }
}
