//! Register command scripts.
//!
//! A [`CommandScript`] is an ordered list of [`Command`]s. Every command is
//! tagged with a [`ProcessType`] that decides which pass runs it: presets at
//! bring-up, the default pass, or on demand as part of a group.
//!
//! Groups are spans delimited by GroupMember-tagged `SectionStart` /
//! `SectionStop` markers. [`CommandScript::index_groups`] walks the script
//! once and records each span in a [`GroupTable`], so a group can later be
//! re-applied by index or name without scanning the script again.

use super::{AddressWidth, RegisterTarget};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;

/// Maximum payload bytes in one command
pub const MAX_PAYLOAD_LEN: usize = 32;

/// Payload plus the widest register address
pub const MAX_BUF_LENGTH: usize = MAX_PAYLOAD_LEN + 2;

/// Maximum commands in one script
pub const MAX_NUM_COMMANDS: usize = 10_000;

/// Default capacity of a group table
pub const MAX_NUM_GROUPS: usize = 10;

/// Operation a command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Write with a 1-byte register address
    Write1,
    /// Write with a 2-byte register address
    Write2,
    Read1,
    Read2,
    ReadModifyWrite1,
    ReadModifyWrite2,
    /// Sleep for `argument` microseconds
    Delay,
    /// Switch to bus device `argument`
    DeviceSelect,
    /// `argument == 0` tolerates bus errors, anything else checks them
    ErrorToleranceToggle,
    SectionStart,
    SectionStop,
}

impl CommandKind {
    /// Register address width, for commands that touch a register
    pub fn address_width(&self) -> Option<AddressWidth> {
        match self {
            CommandKind::Write1 | CommandKind::Read1 | CommandKind::ReadModifyWrite1 => {
                Some(AddressWidth::One)
            }
            CommandKind::Write2 | CommandKind::Read2 | CommandKind::ReadModifyWrite2 => {
                Some(AddressWidth::Two)
            }
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, CommandKind::Write1 | CommandKind::Write2)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, CommandKind::Read1 | CommandKind::Read2)
    }

    pub fn is_read_modify_write(&self) -> bool {
        matches!(
            self,
            CommandKind::ReadModifyWrite1 | CommandKind::ReadModifyWrite2
        )
    }

    pub fn is_section_marker(&self) -> bool {
        matches!(self, CommandKind::SectionStart | CommandKind::SectionStop)
    }

    /// Keyword used by the text format
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CommandKind::Write1 => "w1",
            CommandKind::Write2 => "w2",
            CommandKind::Read1 => "r1",
            CommandKind::Read2 => "r2",
            CommandKind::ReadModifyWrite1 => "rmw1",
            CommandKind::ReadModifyWrite2 => "rmw2",
            CommandKind::Delay => "delay",
            CommandKind::DeviceSelect => "device",
            CommandKind::ErrorToleranceToggle => "errcheck",
            CommandKind::SectionStart => "section_start",
            CommandKind::SectionStop => "section_stop",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Which pass executes a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessType {
    /// Regular bring-up / per-run pass
    #[default]
    Default,
    /// Only applied through its group
    GroupMember,
    /// Applied once before everything else
    PresetMember,
}

/// One script entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub process: ProcessType,
    pub target: RegisterTarget,
    /// Write data, read destination, or value followed by mask for RMW
    pub payload: Vec<u8>,
    /// Delay in microseconds, bus device id, or error-check flag
    pub argument: u32,
    /// Continue past a bus failure on this command
    pub tolerate_errors: bool,
    /// Section name, for markers
    pub label: Option<String>,
}

impl Command {
    fn bare(kind: CommandKind) -> Self {
        Self {
            kind,
            process: ProcessType::Default,
            target: RegisterTarget::default(),
            payload: Vec::new(),
            argument: 0,
            tolerate_errors: false,
            label: None,
        }
    }

    fn register(kind: CommandKind, device: u8, register: u16, payload: Vec<u8>) -> Self {
        let width = kind.address_width().unwrap_or_default();
        Self {
            target: RegisterTarget::new(device, register, width),
            payload,
            ..Self::bare(kind)
        }
    }

    /// Write with a 1- or 2-byte register address, chosen by `width`
    pub fn write(width: AddressWidth, device: u8, register: u16, payload: impl Into<Vec<u8>>) -> Self {
        let kind = match width {
            AddressWidth::One => CommandKind::Write1,
            AddressWidth::Two => CommandKind::Write2,
        };
        Self::register(kind, device, register, payload.into())
    }

    /// Read `len` bytes into the payload
    pub fn read(width: AddressWidth, device: u8, register: u16, len: usize) -> Self {
        let kind = match width {
            AddressWidth::One => CommandKind::Read1,
            AddressWidth::Two => CommandKind::Read2,
        };
        Self::register(kind, device, register, vec![0; len.max(1)])
    }

    /// Replace the bits selected by `mask` with those of `value`
    pub fn read_modify_write(width: AddressWidth, device: u8, register: u16, value: &[u8], mask: &[u8]) -> Self {
        let kind = match width {
            AddressWidth::One => CommandKind::ReadModifyWrite1,
            AddressWidth::Two => CommandKind::ReadModifyWrite2,
        };
        let mut payload = value.to_vec();
        payload.extend_from_slice(mask);
        Self::register(kind, device, register, payload)
    }

    pub fn delay(duration: Duration) -> Self {
        Self {
            argument: u32::try_from(duration.as_micros()).unwrap_or(u32::MAX),
            ..Self::bare(CommandKind::Delay)
        }
    }

    pub fn device_select(device_id: u32) -> Self {
        Self {
            argument: device_id,
            ..Self::bare(CommandKind::DeviceSelect)
        }
    }

    /// `true` aborts on bus errors, `false` tolerates them
    pub fn error_check(enabled: bool) -> Self {
        Self {
            argument: u32::from(enabled),
            ..Self::bare(CommandKind::ErrorToleranceToggle)
        }
    }

    pub fn section_start(process: ProcessType, label: Option<String>) -> Self {
        Self {
            process,
            label,
            ..Self::bare(CommandKind::SectionStart)
        }
    }

    pub fn section_stop(process: ProcessType) -> Self {
        Self {
            process,
            ..Self::bare(CommandKind::SectionStop)
        }
    }

    pub fn with_process(mut self, process: ProcessType) -> Self {
        self.process = process;
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_errors = true;
        self
    }

    pub fn delay_duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.argument))
    }

    /// Split an RMW payload into (value, mask)
    pub fn value_and_mask(&self) -> (&[u8], &[u8]) {
        self.payload.split_at(self.payload.len() / 2)
    }

    fn validate(&self) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PipelineError::Config(format!(
                "{} payload of {} bytes exceeds {}",
                self.kind,
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        if self.kind.is_read_modify_write() && (self.payload.is_empty() || self.payload.len() % 2 != 0) {
            return Err(PipelineError::Config(format!(
                "{} needs equal-length value and mask, got {} bytes",
                self.kind,
                self.payload.len()
            )));
        }
        if let Some(width) = self.kind.address_width() {
            if width == AddressWidth::One && self.target.register > u16::from(u8::MAX) {
                return Err(PipelineError::Config(format!(
                    "register {:#x} does not fit a 1-byte address",
                    self.target.register
                )));
            }
        }
        if self.target.device > 0x7f {
            return Err(PipelineError::Config(format!(
                "device address {:#x} is not a 7-bit address",
                self.target.device
            )));
        }
        Ok(())
    }
}

/// Span of one group inside a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: Option<String>,
    /// First command inside the section
    pub first_command: usize,
    /// Commands between the markers, exclusive
    pub command_count: usize,
}

impl Group {
    pub fn range(&self) -> Range<usize> {
        self.first_command..self.first_command + self.command_count
    }
}

/// Index of all groups in a script, ordered by position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    groups: Vec<Group>,
}

impl GroupTable {
    pub fn get(&self, index: usize) -> Option<&Group> {
        self.groups.get(index)
    }

    pub fn find(&self, name: &str) -> Option<(usize, &Group)> {
        self.groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.name.as_deref() == Some(name))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }
}

/// Ordered list of register commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandScript {
    commands: Vec<Command>,
}

impl CommandScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from commands, validating each
    pub fn from_commands(commands: impl IntoIterator<Item = Command>) -> Result<Self> {
        let mut script = Self::new();
        for command in commands {
            script.push(command)?;
        }
        Ok(script)
    }

    pub fn push(&mut self, command: Command) -> Result<()> {
        if self.commands.len() >= MAX_NUM_COMMANDS {
            return Err(PipelineError::Config(format!(
                "script exceeds {MAX_NUM_COMMANDS} commands"
            )));
        }
        command.validate()?;
        self.commands.push(command);
        Ok(())
    }

    /// Append a register command built from its parts
    pub fn setup_register(&mut self, kind: CommandKind, device: u8, register: u16, payload: &[u8]) -> Result<()> {
        if kind.address_width().is_none() {
            return Err(PipelineError::Config(format!(
                "{kind} does not address a register"
            )));
        }
        self.push(Command::register(kind, device, register, payload.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every command from `len` onwards
    pub fn truncate(&mut self, len: usize) {
        self.commands.truncate(len);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.commands.get(index)
    }

    pub(crate) fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    /// Append every command of `other`
    pub fn extend(&mut self, other: &CommandScript) -> Result<()> {
        for command in &other.commands {
            self.push(command.clone())?;
        }
        Ok(())
    }

    /// Build the group index with the default capacity
    pub fn index_groups(&self) -> Result<GroupTable> {
        self.index_groups_with_capacity(MAX_NUM_GROUPS)
    }

    /// Build the group index.
    ///
    /// Only GroupMember-tagged commands take part. Sections may nest up to
    /// `capacity` deep and the script may hold at most `capacity` groups.
    pub fn index_groups_with_capacity(&self, capacity: usize) -> Result<GroupTable> {
        let mut open: Vec<(usize, Option<String>)> = Vec::new();
        let mut groups = Vec::new();

        for (index, command) in self.commands.iter().enumerate() {
            if command.process != ProcessType::GroupMember {
                continue;
            }
            match command.kind {
                CommandKind::SectionStart => {
                    if open.len() >= capacity {
                        return Err(PipelineError::Config(format!(
                            "section at command {index} nests deeper than {capacity}"
                        )));
                    }
                    open.push((index, command.label.clone()));
                }
                CommandKind::SectionStop => {
                    let (start, name) = open.pop().ok_or_else(|| {
                        PipelineError::Config(format!(
                            "section stop at command {index} has no matching start"
                        ))
                    })?;
                    groups.push(Group {
                        name,
                        first_command: start + 1,
                        command_count: index - start - 1,
                    });
                    if groups.len() > capacity {
                        return Err(PipelineError::Config(format!(
                            "script defines more than {capacity} groups"
                        )));
                    }
                }
                _ if open.is_empty() => {
                    return Err(PipelineError::Config(format!(
                        "group command {index} ({}) outside any section",
                        command.kind
                    )));
                }
                _ => {}
            }
        }

        if let Some((start, _)) = open.last() {
            return Err(PipelineError::Config(format!(
                "section started at command {start} is never closed"
            )));
        }

        groups.sort_by_key(|g| g.first_command);
        Ok(GroupTable { groups })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn group_write(register: u16) -> Command {
        Command::write(AddressWidth::Two, 0x30, register, [0x01]).with_process(ProcessType::GroupMember)
    }

    fn start(name: &str) -> Command {
        Command::section_start(ProcessType::GroupMember, Some(name.to_string()))
    }

    fn stop() -> Command {
        Command::section_stop(ProcessType::GroupMember)
    }

    #[test]
    fn test_group_spans() {
        let script = CommandScript::from_commands([
            Command::write(AddressWidth::Two, 0x30, 0x3000, [0x00]),
            start("exposure"),
            group_write(0x3012),
            group_write(0x3014),
            stop(),
            start("gain"),
            group_write(0x305e),
            stop(),
        ])
        .unwrap();

        let table = script.index_groups().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().range(), 2..4);
        assert_eq!(table.get(1).unwrap().range(), 6..7);
        assert_eq!(table.find("gain").unwrap().0, 1);
    }

    #[test]
    fn test_nested_groups_ordered_by_position() {
        let script = CommandScript::from_commands([
            start("outer"),
            group_write(1),
            start("inner"),
            group_write(2),
            stop(),
            stop(),
        ])
        .unwrap();

        let table = script.index_groups().unwrap();
        assert_eq!(table.get(0).unwrap().name.as_deref(), Some("outer"));
        assert_eq!(table.get(0).unwrap().command_count, 4);
        assert_eq!(table.get(1).unwrap().range(), 3..4);
    }

    #[test]
    fn test_unmatched_stop_rejected() {
        let script = CommandScript::from_commands([group_write(1), stop()]).unwrap();
        // the write is outside a section before the stop is even seen
        assert!(script.index_groups().is_err());

        let script = CommandScript::from_commands([stop()]).unwrap();
        let err = script.index_groups().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_unterminated_start_rejected() {
        let script = CommandScript::from_commands([start("a"), group_write(1)]).unwrap();
        assert!(matches!(
            script.index_groups().unwrap_err(),
            PipelineError::Config(_)
        ));
    }

    #[test]
    fn test_nesting_beyond_capacity_rejected() {
        let script = CommandScript::from_commands([
            start("a"),
            start("b"),
            start("c"),
            stop(),
            stop(),
            stop(),
        ])
        .unwrap();
        assert!(script.index_groups_with_capacity(2).is_err());
        assert!(script.index_groups_with_capacity(3).is_ok());
    }

    #[test]
    fn test_too_many_groups_rejected() {
        let mut commands = Vec::new();
        for i in 0..3 {
            commands.push(start(&format!("g{i}")));
            commands.push(stop());
        }
        let script = CommandScript::from_commands(commands).unwrap();
        assert!(script.index_groups_with_capacity(2).is_err());
    }

    #[test]
    fn test_non_group_sections_ignored() {
        let script = CommandScript::from_commands([
            Command::section_start(ProcessType::PresetMember, None),
            Command::write(AddressWidth::One, 0x40, 0x10, [1]).with_process(ProcessType::PresetMember),
            Command::section_stop(ProcessType::PresetMember),
        ])
        .unwrap();
        assert!(script.index_groups().unwrap().is_empty());
    }

    #[test]
    fn test_limits() {
        let mut script = CommandScript::new();
        assert!(script
            .push(Command::write(AddressWidth::One, 0x40, 0x10, vec![0; MAX_PAYLOAD_LEN + 1]))
            .is_err());
        assert!(script
            .push(Command::write(AddressWidth::One, 0x40, 0x1ff, [0]))
            .is_err());
        assert!(script
            .push(Command::write(AddressWidth::One, 0x80, 0x10, [0]))
            .is_err());
        assert!(script
            .setup_register(CommandKind::Delay, 0x40, 0, &[])
            .is_err());

        let mut rmw = Command::read_modify_write(AddressWidth::One, 0x40, 0x10, &[0x01], &[0x0f]);
        rmw.payload.push(0xff);
        assert!(script.push(rmw).is_err());
    }

    #[test]
    fn test_setup_register_and_truncate() {
        let mut script = CommandScript::new();
        script.setup_register(CommandKind::Write2, 0x30, 0x3012, &[0x01, 0x00]).unwrap();
        script.setup_register(CommandKind::Read1, 0x40, 0x1e, &[0]).unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script.get(0).unwrap().target.width, AddressWidth::Two);
        script.truncate(1);
        assert_eq!(script.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_one_entry_per_section(sizes in proptest::collection::vec(0usize..6, 0..10)) {
            let mut commands = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                commands.push(start(&format!("g{i}")));
                for r in 0..*size {
                    commands.push(group_write(r as u16));
                }
                commands.push(stop());
                commands.push(Command::delay(Duration::from_micros(1)));
            }
            let script = CommandScript::from_commands(commands).unwrap();
            let table = script.index_groups().unwrap();
            prop_assert_eq!(table.len(), sizes.len());
            for (group, size) in table.iter().zip(&sizes) {
                prop_assert_eq!(group.command_count, *size);
                for index in group.range() {
                    prop_assert_eq!(script.get(index).unwrap().process, ProcessType::GroupMember);
                }
            }
        }
    }
}
