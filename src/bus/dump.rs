//! Register dump writer.
//!
//! Dumps list every register a script touched, one byte per line, in the
//! form `<8-bit device address> <register> <value>`. Multi-byte payloads are
//! expanded over consecutive registers. Each script is written under its own
//! `#<title>` heading so dumps taken from several sources can be diffed.

use super::script::{CommandKind, CommandScript};
use super::AddressWidth;
use crate::error::{Result, ResultExt};
use chrono::Utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write a dump of each `(title, script)` section
pub fn write_dump<W: Write>(writer: &mut W, sections: &[(&str, &CommandScript)]) -> Result<()> {
    writeln!(writer, "# generated {}", Utc::now().to_rfc3339())?;
    for (title, script) in sections {
        writeln!(writer, "#{title}")?;
        for command in script.commands() {
            let data = match command.kind {
                CommandKind::Write1 | CommandKind::Write2 | CommandKind::Read1 | CommandKind::Read2 => {
                    command.payload.as_slice()
                }
                CommandKind::ReadModifyWrite1 | CommandKind::ReadModifyWrite2 => command.value_and_mask().0,
                _ => continue,
            };
            let address = command.target.device << 1;
            for (offset, value) in data.iter().enumerate() {
                let target = command.target.offset(offset as u16);
                match target.width {
                    AddressWidth::One => writeln!(writer, "{address:02x} {:02x} {value:02x}", target.register)?,
                    AddressWidth::Two => writeln!(writer, "{address:02x} {:04x} {value:02x}", target.register)?,
                }
            }
        }
    }
    Ok(())
}

/// Write a dump file, replacing any existing one
pub fn dump_to_file(path: &Path, sections: &[(&str, &CommandScript)]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create dump {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_dump(&mut writer, sections)?;
    writer.flush()?;
    tracing::info!("Register dump written to {}", path.display());
    Ok(())
}
