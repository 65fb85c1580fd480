//! Text register-script format.
//!
//! One command per line, `#` starts a comment, numbers are decimal or `0x`
//! hex:
//!
//! ```text
//! param sensor ov10640
//! device 2                      # switch bus device
//! errcheck off                  # tolerate bus errors from here on
//! delay 5000                    # microseconds
//! w2 0x30 0x3012 0x00 0x20      # device, register, payload...
//! r1 0x40 0x1e 2                # device, register, length
//! rmw1 0x40 0x04 0x01 mask 0x03 # value bytes, then optional mask bytes
//! w1 0x40 0x10 0x01 tolerant    # this command alone tolerates errors
//! section_start group exposure
//! w2 0x30 0x3012 0x01 0x00
//! section_stop
//! ```
//!
//! Commands inside a `group` section are tagged GroupMember, inside a
//! `preset` section PresetMember, everywhere else Default.

use super::script::{Command, CommandKind, CommandScript, ProcessType};
use super::AddressWidth;
use crate::error::{PipelineError, Result, ResultExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// A parsed script plus its `param` lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedScript {
    pub script: CommandScript,
    pub params: BTreeMap<String, String>,
}

/// Parse a script file
pub fn parse_file(path: &Path) -> Result<ParsedScript> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read register script {}", path.display()))?;
    parse_script(&text).with_context(|| format!("parse {}", path.display()))
}

/// Parse script text
pub fn parse_script(text: &str) -> Result<ParsedScript> {
    let mut parsed = ParsedScript::default();
    let mut sections: Vec<(ProcessType, usize)> = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = number + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = content.split_whitespace().collect();
        let process = sections
            .last()
            .map(|(p, _)| *p)
            .unwrap_or(ProcessType::Default);

        let command = match tokens[0] {
            "param" => {
                let [_, key, rest @ ..] = tokens.as_slice() else {
                    return Err(parse_error(line, "param needs a key"));
                };
                parsed.params.insert(key.to_string(), rest.join(" "));
                continue;
            }
            "section_start" => {
                let kind = tokens.get(1).copied().unwrap_or("group");
                let process = match kind {
                    "group" => ProcessType::GroupMember,
                    "preset" => ProcessType::PresetMember,
                    "default" => ProcessType::Default,
                    other => return Err(parse_error(line, format!("unknown section type `{other}`"))),
                };
                sections.push((process, line));
                Command::section_start(process, tokens.get(2).map(|s| s.to_string()))
            }
            "section_stop" => {
                let (process, _) = sections
                    .pop()
                    .ok_or_else(|| parse_error(line, "section_stop without section_start"))?;
                Command::section_stop(process)
            }
            "device" => {
                let device = u32::try_from(number_arg(&tokens, 1, line)?)
                    .map_err(|_| parse_error(line, "device id exceeds 32 bits"))?;
                Command::device_select(device)
            }
            "errcheck" => match tokens.get(1).copied() {
                Some("on") => Command::error_check(true),
                Some("off") => Command::error_check(false),
                _ => return Err(parse_error(line, "errcheck takes `on` or `off`")),
            },
            "delay" => Command::delay(Duration::from_micros(number_arg(&tokens, 1, line)?)),
            keyword => register_command(keyword, &tokens, line)?,
        };

        let command = match command.kind {
            CommandKind::SectionStart | CommandKind::SectionStop => command,
            _ => command.with_process(process),
        };
        parsed
            .script
            .push(command)
            .map_err(|e| parse_error(line, e.to_string()))?;
    }

    if let Some((_, line)) = sections.last() {
        return Err(parse_error(*line, "section_start is never closed"));
    }
    Ok(parsed)
}

fn register_command(keyword: &str, tokens: &[&str], line: usize) -> Result<Command> {
    let (kind, width) = match keyword {
        "w1" => (CommandKind::Write1, AddressWidth::One),
        "w2" => (CommandKind::Write2, AddressWidth::Two),
        "r1" => (CommandKind::Read1, AddressWidth::One),
        "r2" => (CommandKind::Read2, AddressWidth::Two),
        "rmw1" => (CommandKind::ReadModifyWrite1, AddressWidth::One),
        "rmw2" => (CommandKind::ReadModifyWrite2, AddressWidth::Two),
        other => return Err(parse_error(line, format!("unknown keyword `{other}`"))),
    };

    let device = byte_arg(tokens, 1, line)?;
    let register = u16::try_from(number_arg(tokens, 2, line)?)
        .map_err(|_| parse_error(line, "register address exceeds 16 bits"))?;

    let mut rest = &tokens[3.min(tokens.len())..];
    let tolerant = rest.last() == Some(&"tolerant");
    if tolerant {
        rest = &rest[..rest.len() - 1];
    }

    let command = if kind.is_read() {
        let len = match rest {
            [] => 1,
            [len] => usize::try_from(parse_number(len, line)?)
                .map_err(|_| parse_error(line, format!("read length `{len}` is too large")))?,
            _ => return Err(parse_error(line, "read takes at most a length")),
        };
        Command::read(width, device, register, len)
    } else if kind.is_read_modify_write() {
        let split = rest.iter().position(|t| *t == "mask");
        let (value_tokens, mask_tokens) = match split {
            Some(at) => (&rest[..at], &rest[at + 1..]),
            None => (rest, &[][..]),
        };
        let value = bytes(value_tokens, line)?;
        let mask = if mask_tokens.is_empty() {
            vec![0xff; value.len()]
        } else {
            bytes(mask_tokens, line)?
        };
        if value.is_empty() || value.len() != mask.len() {
            return Err(parse_error(line, "rmw needs value and mask of equal length"));
        }
        Command::read_modify_write(width, device, register, &value, &mask)
    } else {
        Command::write(width, device, register, bytes(rest, line)?)
    };

    Ok(if tolerant { command.tolerant() } else { command })
}

fn parse_error(line: usize, message: impl Into<String>) -> PipelineError {
    PipelineError::Parse {
        line,
        message: message.into(),
    }
}

fn parse_number(token: &str, line: usize) -> Result<u64> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| parse_error(line, format!("`{token}` is not a number")))
}

fn number_arg(tokens: &[&str], index: usize, line: usize) -> Result<u64> {
    let token = tokens
        .get(index)
        .ok_or_else(|| parse_error(line, format!("`{}` is missing an argument", tokens[0])))?;
    parse_number(token, line)
}

fn byte_arg(tokens: &[&str], index: usize, line: usize) -> Result<u8> {
    u8::try_from(number_arg(tokens, index, line)?)
        .map_err(|_| parse_error(line, "value exceeds one byte"))
}

fn bytes(tokens: &[&str], line: usize) -> Result<Vec<u8>> {
    tokens
        .iter()
        .map(|t| {
            u8::try_from(parse_number(t, line)?)
                .map_err(|_| parse_error(line, format!("`{t}` exceeds one byte")))
        })
        .collect()
}
