//! Replays command scripts against a serial bus.
//!
//! [`BusInterpreter::execute`] walks a range of a script in order. The pass
//! type filters write-mode passes: commands tagged with a different
//! [`ProcessType`] are skipped, so one script can hold presets, default
//! bring-up and groups side by side.
//!
//! # Read mode
//!
//! A read pass produces only reads, for register dumps:
//! - writes read the register back into their payload instead;
//! - read-modify-writes perform only the read, into the value half;
//! - delays are skipped.
//!
//! Device selects and error-check toggles behave the same in both modes.
//!
//! # Error tolerance
//!
//! Every execution starts in checking mode. An `ErrorToleranceToggle`
//! command switches between checking and tolerating, and a single command
//! may also be marked tolerant. A bus failure under tolerance is logged and
//! skipped; otherwise it aborts the execution. Failing to open a device is
//! always fatal.

use super::script::{Command, CommandKind, CommandScript, GroupTable, ProcessType};
use super::{BusHandle, SerialBus};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::thread;
use std::time::Duration;

/// Direction of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusOperation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterOptions {
    /// Read back every write and compare
    pub verify_writes: bool,
    /// Pause after each write
    pub write_settle: Duration,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            verify_writes: false,
            write_settle: Duration::from_micros(crate::config::DEFAULT_WRITE_SETTLE_US),
        }
    }
}

/// What one execution did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub executed: usize,
    /// Filtered out by process type or mode
    pub skipped: usize,
    /// Bus failures continued past under tolerance
    pub tolerated_failures: usize,
    /// Verified writes whose readback differed
    pub verify_mismatches: usize,
}

/// Script executor owning a bus
pub struct BusInterpreter<B: SerialBus> {
    bus: B,
    default_device: u32,
    options: InterpreterOptions,
}

impl<B: SerialBus> BusInterpreter<B> {
    pub fn new(bus: B, default_device: u32) -> Self {
        Self {
            bus,
            default_device,
            options: InterpreterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InterpreterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Run `range` of `script`.
    ///
    /// `device` overrides the bus device opened at the start; the active
    /// handle is closed on every exit path.
    pub fn execute(
        &mut self,
        script: &mut CommandScript,
        range: Range<usize>,
        operation: BusOperation,
        pass: ProcessType,
        device: Option<u32>,
    ) -> Result<ExecutionReport> {
        if range.start > range.end || range.end > script.len() {
            return Err(PipelineError::Config(format!(
                "range {:?} outside script of {} commands",
                range,
                script.len()
            )));
        }

        let device = device.unwrap_or(self.default_device);
        let handle = self
            .bus
            .open(device)
            .map_err(|e| e.with_context(format!("open bus device {device}")))?;

        let mut run = Run {
            handle: Some(handle),
            check_errors: true,
            report: ExecutionReport::default(),
        };
        let first = range.start;
        let result = self.run(&mut script.commands_mut()[range], first, operation, pass, &mut run);

        if let Some(handle) = run.handle.take() {
            self.bus.close(handle);
        }
        result.map(|_| run.report)
    }

    /// PresetMember commands, written once at bring-up
    pub fn process_initial(&mut self, script: &mut CommandScript) -> Result<ExecutionReport> {
        let len = script.len();
        self.execute(script, 0..len, BusOperation::Write, ProcessType::PresetMember, None)
    }

    /// Default commands, written after the presets
    pub fn process_default(&mut self, script: &mut CommandScript) -> Result<ExecutionReport> {
        let len = script.len();
        self.execute(script, 0..len, BusOperation::Write, ProcessType::Default, None)
    }

    /// Apply group `index` of `groups`
    pub fn process_group(
        &mut self,
        script: &mut CommandScript,
        groups: &GroupTable,
        index: usize,
    ) -> Result<ExecutionReport> {
        let group = groups
            .get(index)
            .ok_or_else(|| PipelineError::Config(format!("no group {index}")))?;
        self.execute(script, group.range(), BusOperation::Write, ProcessType::GroupMember, None)
    }

    /// Apply the group called `name`
    pub fn process_group_named(
        &mut self,
        script: &mut CommandScript,
        groups: &GroupTable,
        name: &str,
    ) -> Result<ExecutionReport> {
        let (index, _) = groups
            .find(name)
            .ok_or_else(|| PipelineError::Config(format!("no group named `{name}`")))?;
        self.process_group(script, groups, index)
    }

    /// Read every register the script touches back into its payloads
    pub fn read_back(&mut self, script: &mut CommandScript) -> Result<ExecutionReport> {
        let len = script.len();
        self.execute(script, 0..len, BusOperation::Read, ProcessType::Default, None)
    }

    fn run(
        &mut self,
        commands: &mut [Command],
        first: usize,
        operation: BusOperation,
        pass: ProcessType,
        run: &mut Run,
    ) -> Result<()> {
        for (offset, command) in commands.iter_mut().enumerate() {
            let index = first + offset;
            if operation == BusOperation::Write && command.process != pass {
                run.report.skipped += 1;
                continue;
            }

            match command.kind {
                CommandKind::DeviceSelect => {
                    if let Some(handle) = run.handle.take() {
                        self.bus.close(handle);
                    }
                    let handle = self.bus.open(command.argument).map_err(|e| {
                        e.with_context(format!("command {index}: select device {}", command.argument))
                    })?;
                    run.handle = Some(handle);
                }
                CommandKind::ErrorToleranceToggle => {
                    run.check_errors = command.argument != 0;
                }
                CommandKind::Delay => {
                    if operation == BusOperation::Read {
                        run.report.skipped += 1;
                        continue;
                    }
                    thread::sleep(command.delay_duration());
                }
                CommandKind::SectionStart | CommandKind::SectionStop => continue,
                _ => {
                    let handle = run.active(index)?;
                    if let Err(e) = self.register_op(handle, command, operation, &mut run.report) {
                        if command.tolerate_errors || !run.check_errors {
                            tracing::warn!(command = index, kind = %command.kind, "Tolerated bus failure: {}", e);
                            run.report.tolerated_failures += 1;
                            continue;
                        }
                        return Err(e.with_context(format!(
                            "command {index} ({} {})",
                            command.kind, command.target
                        )));
                    }
                }
            }
            run.report.executed += 1;
        }
        Ok(())
    }

    fn register_op(
        &mut self,
        handle: BusHandle,
        command: &mut Command,
        operation: BusOperation,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let kind = command.kind;
        match operation {
            BusOperation::Read if kind.is_read_modify_write() => {
                let len = command.payload.len() / 2;
                let current = self.bus.read_register(handle, command.target, len)?;
                command.payload[..len].copy_from_slice(&fit(&current, len));
            }
            BusOperation::Read => self.read_into(handle, command)?,
            BusOperation::Write if kind.is_read() => self.read_into(handle, command)?,
            BusOperation::Write if kind.is_write() => {
                self.bus.write_register(handle, command.target, &command.payload)?;
                self.settle();
                if self.options.verify_writes {
                    self.verify(handle, command, &command.payload, report)?;
                }
            }
            BusOperation::Write => {
                let (value, mask) = command.value_and_mask();
                let current = self.bus.read_register(handle, command.target, value.len())?;
                let merged = splice(&fit(&current, value.len()), value, mask);
                self.bus.write_register(handle, command.target, &merged)?;
                self.settle();
                if self.options.verify_writes {
                    self.verify(handle, command, &merged, report)?;
                }
            }
        }
        Ok(())
    }

    fn read_into(&mut self, handle: BusHandle, command: &mut Command) -> Result<()> {
        let len = command.payload.len().max(1);
        let data = self.bus.read_register(handle, command.target, len)?;
        command.payload = fit(&data, len);
        Ok(())
    }

    fn verify(
        &mut self,
        handle: BusHandle,
        command: &Command,
        expected: &[u8],
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let actual = self.bus.read_register(handle, command.target, expected.len())?;
        if actual != expected {
            tracing::warn!(
                target = %command.target,
                "Write verify mismatch: wrote {:02x?}, read {:02x?}",
                expected,
                actual
            );
            report.verify_mismatches += 1;
        }
        Ok(())
    }

    fn settle(&self) {
        if !self.options.write_settle.is_zero() {
            thread::sleep(self.options.write_settle);
        }
    }
}

/// Per-execution state
struct Run {
    handle: Option<BusHandle>,
    check_errors: bool,
    report: ExecutionReport,
}

impl Run {
    fn active(&self, index: usize) -> Result<BusHandle> {
        self.handle.ok_or_else(|| {
            PipelineError::bus("access", format!("command {index} has no open bus device"))
        })
    }
}

/// Pad or cut `data` to exactly `len` bytes
fn fit(data: &[u8], len: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    out.resize(len, 0);
    out
}

/// `(old & !mask) | (value & mask)`, bytewise
pub fn splice(old: &[u8], value: &[u8], mask: &[u8]) -> Vec<u8> {
    old.iter()
        .zip(value)
        .zip(mask)
        .map(|((o, v), m)| (o & !m) | (v & m))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MemoryBus;
    use crate::bus::{AddressWidth, MockSerialBus, RegisterTarget};
    use mockall::predicate::*;
    use mockall::Sequence;

    fn interpreter(bus: MemoryBus) -> BusInterpreter<MemoryBus> {
        BusInterpreter::new(bus, 0).with_options(InterpreterOptions {
            verify_writes: false,
            write_settle: Duration::ZERO,
        })
    }

    fn w(register: u16, value: u8) -> Command {
        Command::write(AddressWidth::Two, 0x30, register, [value])
    }

    #[test]
    fn test_default_pass_skips_other_process_types() {
        let mut script = CommandScript::from_commands([
            w(0x3000, 1).with_process(ProcessType::PresetMember),
            w(0x3002, 2),
            w(0x3004, 3).with_process(ProcessType::GroupMember),
        ])
        .unwrap();
        let mut interp = interpreter(MemoryBus::new());

        let report = interp.process_default(&mut script).unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(interp.bus().register(0, 0x30, 0x3002), Some(2));
        assert_eq!(interp.bus().register(0, 0x30, 0x3000), None);

        interp.process_initial(&mut script).unwrap();
        assert_eq!(interp.bus().register(0, 0x30, 0x3000), Some(1));
    }

    #[test]
    fn test_failure_aborts_when_checking() {
        let mut script = CommandScript::from_commands([w(0x10, 1), w(0x12, 2), w(0x14, 3)]).unwrap();
        let mut bus = MemoryBus::new();
        bus.fail_writes_to(0x30, 0x12);
        let mut interp = interpreter(bus);

        let err = interp.process_default(&mut script).unwrap_err();
        assert!(matches!(err.root(), PipelineError::Bus { .. }));
        assert_eq!(interp.bus().register(0, 0x30, 0x10), Some(1));
        assert_eq!(interp.bus().register(0, 0x30, 0x14), None);
        assert_eq!(interp.bus().open_handles(), 0);
    }

    #[test]
    fn test_failure_continues_when_tolerated() {
        let mut script = CommandScript::from_commands([
            Command::error_check(false),
            w(0x10, 1),
            w(0x12, 2),
            w(0x14, 3),
        ])
        .unwrap();
        let mut bus = MemoryBus::new();
        bus.fail_writes_to(0x30, 0x12);
        let mut interp = interpreter(bus);

        let report = interp.process_default(&mut script).unwrap();
        assert_eq!(report.tolerated_failures, 1);
        assert_eq!(interp.bus().register(0, 0x30, 0x14), Some(3));
    }

    #[test]
    fn test_per_command_tolerance() {
        let mut script = CommandScript::from_commands([w(0x12, 2).tolerant(), w(0x14, 3)]).unwrap();
        let mut bus = MemoryBus::new();
        bus.fail_writes_to(0x30, 0x12);
        let mut interp = interpreter(bus);

        interp.process_default(&mut script).unwrap();
        assert_eq!(interp.bus().register(0, 0x30, 0x14), Some(3));
    }

    #[test]
    fn test_device_select_switches_handle() {
        let mut script = CommandScript::from_commands([
            w(0x10, 1),
            Command::device_select(7),
            w(0x10, 2),
        ])
        .unwrap();
        let mut interp = interpreter(MemoryBus::new());

        interp.process_default(&mut script).unwrap();
        assert_eq!(interp.bus().register(0, 0x30, 0x10), Some(1));
        assert_eq!(interp.bus().register(7, 0x30, 0x10), Some(2));
        assert_eq!(interp.bus().open_handles(), 0);
    }

    #[test]
    fn test_device_select_failure_is_fatal_even_when_tolerant() {
        let mut script = CommandScript::from_commands([
            Command::error_check(false),
            Command::device_select(9),
            w(0x10, 1),
        ])
        .unwrap();
        let mut bus = MemoryBus::new();
        bus.fail_open(9);
        let mut interp = interpreter(bus);

        assert!(interp.process_default(&mut script).is_err());
        assert_eq!(interp.bus().open_handles(), 0);
    }

    #[test]
    fn test_read_modify_write_splices_under_mask() {
        let mut bus = MemoryBus::new();
        bus.set_register(0, 0x30, 0x20, 0b1010_1010);
        let mut script = CommandScript::from_commands([Command::read_modify_write(
            AddressWidth::Two,
            0x30,
            0x20,
            &[0b0000_0101],
            &[0b0000_1111],
        )])
        .unwrap();
        let mut interp = interpreter(bus);

        interp.process_default(&mut script).unwrap();
        assert_eq!(interp.bus().register(0, 0x30, 0x20), Some(0b1010_0101));
    }

    #[test]
    fn test_read_mode_reads_back_writes_without_writing() {
        let mut bus = MemoryBus::new();
        bus.set_register(0, 0x30, 0x10, 0x55);
        let mut script = CommandScript::from_commands([
            w(0x10, 0x01),
            Command::delay(Duration::from_secs(60)),
            Command::read(AddressWidth::Two, 0x30, 0x12, 1),
        ])
        .unwrap();
        let mut interp = interpreter(bus);

        let report = interp.read_back(&mut script).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(script.get(0).unwrap().payload, vec![0x55]);
        assert_eq!(interp.bus().register(0, 0x30, 0x10), Some(0x55));
        assert_eq!(interp.bus().writes(), 0);
    }

    #[test]
    fn test_verify_counts_mismatch() {
        let mut bus = MemoryBus::new();
        bus.make_read_only(0x30, 0x10);
        let mut script = CommandScript::from_commands([w(0x10, 0x01)]).unwrap();
        let mut interp = BusInterpreter::new(bus, 0).with_options(InterpreterOptions {
            verify_writes: true,
            write_settle: Duration::ZERO,
        });

        let report = interp.process_default(&mut script).unwrap();
        assert_eq!(report.verify_mismatches, 1);
    }

    #[test]
    fn test_group_execution_uses_group_span() {
        let mut script = CommandScript::from_commands([
            w(0x10, 1),
            Command::section_start(ProcessType::GroupMember, Some("exposure".into())),
            w(0x3012, 0x20).with_process(ProcessType::GroupMember),
            Command::section_stop(ProcessType::GroupMember),
        ])
        .unwrap();
        let groups = script.index_groups().unwrap();
        let mut interp = interpreter(MemoryBus::new());

        interp.process_group_named(&mut script, &groups, "exposure").unwrap();
        assert_eq!(interp.bus().register(0, 0x30, 0x3012), Some(0x20));
        assert_eq!(interp.bus().register(0, 0x30, 0x10), None);
        assert!(interp.process_group(&mut script, &groups, 3).is_err());
    }

    #[test]
    fn test_range_outside_script_rejected() {
        let mut script = CommandScript::from_commands([w(0x10, 1)]).unwrap();
        let mut interp = interpreter(MemoryBus::new());
        assert!(interp
            .execute(&mut script, 0..2, BusOperation::Write, ProcessType::Default, None)
            .is_err());
    }

    #[test]
    fn test_call_sequence_with_mock_bus() {
        let mut bus = MockSerialBus::new();
        let mut seq = Sequence::new();
        let target = RegisterTarget::new(0x30, 0x3012, AddressWidth::Two);

        bus.expect_open()
            .with(eq(4))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BusHandle(1)));
        bus.expect_write_register()
            .withf(move |h, t, p| *h == BusHandle(1) && *t == target && *p == [0xaa_u8])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(PipelineError::bus("write", "nack")));
        bus.expect_close()
            .with(eq(BusHandle(1)))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut script = CommandScript::from_commands([
            Command::write(AddressWidth::Two, 0x30, 0x3012, [0xaa]),
            Command::write(AddressWidth::Two, 0x30, 0x3014, [0xbb]),
        ])
        .unwrap();
        let mut interp = BusInterpreter::new(bus, 4).with_options(InterpreterOptions {
            verify_writes: false,
            write_settle: Duration::ZERO,
        });

        // second write never reaches the bus
        assert!(interp.process_default(&mut script).is_err());
    }

    #[test]
    fn test_splice() {
        assert_eq!(splice(&[0xff, 0x00], &[0x00, 0xff], &[0x0f, 0xf0]), vec![0xf0, 0xf0]);
    }
}
