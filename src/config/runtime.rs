//! Runtime settings schedule.
//!
//! A repeating sequence of `(frames, script, tag)` entries. Frame `n` maps to
//! the entry whose cumulative span holds `n % total_frames`.

use super::RuntimeSettingConfig;
use crate::bus::{parser, CommandScript};
use crate::error::{PipelineError, Result};

/// One active-for-N-frames setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSetting {
    pub frames: u32,
    pub script: CommandScript,
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSchedule {
    settings: Vec<RuntimeSetting>,
    total_frames: u64,
}

impl RuntimeSchedule {
    pub fn new(settings: Vec<RuntimeSetting>) -> Result<Self> {
        if let Some(empty) = settings.iter().find(|s| s.frames == 0) {
            return Err(PipelineError::Config(format!(
                "runtime setting `{}` covers zero frames",
                empty.tag
            )));
        }
        let total_frames = settings.iter().map(|s| u64::from(s.frames)).sum();
        Ok(Self {
            settings,
            total_frames,
        })
    }

    /// Build from configuration, parsing each referenced script file
    pub fn from_config(entries: &[RuntimeSettingConfig]) -> Result<Self> {
        let settings = entries
            .iter()
            .map(|entry| {
                let script = match &entry.script {
                    Some(path) => parser::parse_file(path)?.script,
                    None => CommandScript::new(),
                };
                Ok(RuntimeSetting {
                    frames: entry.frames,
                    script,
                    tag: entry.tag.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(settings)
    }

    /// Entry active for `frame`, `None` for an empty schedule
    pub fn index_for_frame(&self, frame: u64) -> Option<usize> {
        if self.total_frames == 0 {
            return None;
        }
        let mut remaining = frame % self.total_frames;
        for (index, setting) in self.settings.iter().enumerate() {
            let span = u64::from(setting.frames);
            if remaining < span {
                return Some(index);
            }
            remaining -= span;
        }
        None
    }

    pub fn get(&self, index: usize) -> Option<&RuntimeSetting> {
        self.settings.get(index)
    }

    pub fn tag_for_frame(&self, frame: u64) -> Option<&str> {
        self.index_for_frame(frame)
            .and_then(|i| self.settings.get(i))
            .map(|s| s.tag.as_str())
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}
