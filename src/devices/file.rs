//! On-disk frame writer

use super::{FileWriter, FrameRecord};
use crate::buffer::FrameBuffer;
use crate::error::{Result, ResultExt};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes the pixel bytes of each frame, optionally with a JSON sidecar
#[derive(Debug, Clone)]
pub struct RawFileWriter {
    sidecar: bool,
}

impl RawFileWriter {
    pub fn new(sidecar: bool) -> Self {
        Self { sidecar }
    }
}

impl FileWriter for RawFileWriter {
    fn write(&mut self, path: &Path, buffer: &FrameBuffer, record: &FrameRecord) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }

        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(buffer.data())
            .and_then(|_| out.flush())
            .with_context(|| format!("write {}", path.display()))?;

        if self.sidecar {
            let sidecar = path.with_extension("json");
            let file =
                File::create(&sidecar).with_context(|| format!("create {}", sidecar.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), record)?;
        }

        tracing::trace!(path = %path.display(), bytes = buffer.data().len(), "Frame written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PoolRegistry, Wait};
    use crate::types::{FrameMeta, SurfaceFormat};
    use tempfile::tempdir;

    #[test]
    fn test_writes_pixels_and_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames").join("out_vc0_00.raw");

        let mut registry = PoolRegistry::new();
        let id = registry
            .create_pool("p", 1, FrameMeta::new(4, 2, SurfaceFormat::Raw8))
            .unwrap();
        let mut buffer = registry.pool(id).unwrap().acquire(Wait::Immediate, None).unwrap();
        buffer.data_mut().fill(0xAB);
        let record = FrameRecord::for_buffer(&buffer, 0, 0, "");

        RawFileWriter::new(true).write(&path, &buffer, &record).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0xAB; 8]);
        let sidecar: FrameRecord =
            serde_json::from_str(&std::fs::read_to_string(path.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(sidecar.width, 4);
        assert_eq!(sidecar.channel, 0);

        registry.recycle(buffer).unwrap();
    }
}
