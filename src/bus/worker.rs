//! Bus-owning worker thread.
//!
//! After bring-up every bus access goes through one [`BusWorker`], so a
//! `DeviceSelect` in a runtime script can never race a calibration pass.
//! Other threads talk to it through a [`BusClient`] over crossbeam channels.

use super::interpreter::{BusInterpreter, BusOperation, ExecutionReport};
use super::script::{CommandScript, GroupTable, ProcessType};
use super::{dump, SerialBus};
use crate::config::RuntimeSchedule;
use crate::error::{PipelineError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the worker blocks on its command channel per iteration
const COMMAND_POLL: Duration = Duration::from_millis(100);

/// Commands that may queue up before senders see the channel as full
const COMMAND_CAPACITY: usize = 64;

/// Request sent to the bus worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    /// Run the whole main script
    RunScript {
        operation: BusOperation,
        pass: ProcessType,
    },
    /// Apply a group by index
    ApplyGroup(usize),
    /// Apply a group by name
    ApplyGroupNamed(String),
    /// Apply the script of a runtime setting
    ApplyRuntimeSetting(usize),
    /// Read every scripted register back and dump them to a file
    Dump(PathBuf),
    Shutdown,
}

/// Reply from the bus worker
#[derive(Debug, Clone)]
pub enum BusMessage {
    Completed {
        command: BusCommand,
        report: ExecutionReport,
    },
    Failed {
        command: BusCommand,
        error: String,
    },
    Dumped(PathBuf),
    /// Worker is shutting down
    Shutdown,
}

/// Handle for sending commands to the bus worker and reading its replies
#[derive(Debug, Clone)]
pub struct BusClient {
    /// Receiver for worker replies
    pub receiver: Receiver<BusMessage>,
    /// Sender for commands to the worker
    pub command_sender: Sender<BusCommand>,
}

impl BusClient {
    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    /// Receive all pending messages
    pub fn drain(&self) -> Vec<BusMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.receiver.try_recv() {
            messages.push(msg);
        }
        messages
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<BusMessage> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Send a command to the worker
    pub fn send_command(&self, cmd: BusCommand) -> bool {
        self.command_sender.send(cmd).is_ok()
    }

    pub fn run_script(&self, operation: BusOperation, pass: ProcessType) {
        let _ = self.command_sender.send(BusCommand::RunScript { operation, pass });
    }

    pub fn apply_group(&self, index: usize) {
        let _ = self.command_sender.send(BusCommand::ApplyGroup(index));
    }

    pub fn apply_group_named(&self, name: impl Into<String>) {
        let _ = self
            .command_sender
            .send(BusCommand::ApplyGroupNamed(name.into()));
    }

    /// Never blocks, so a stalled worker cannot hold up the frame path.
    /// Returns `false` if the request was not queued.
    pub fn apply_runtime_setting(&self, index: usize) -> bool {
        match self.command_sender.try_send(BusCommand::ApplyRuntimeSetting(index)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Bus command channel full, dropping runtime setting {}", index);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dump(&self, path: impl Into<PathBuf>) {
        let _ = self.command_sender.send(BusCommand::Dump(path.into()));
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(BusCommand::Shutdown);
    }
}

/// Owns the bus and the scripts replayed on it
pub struct BusWorker<B: SerialBus> {
    interpreter: BusInterpreter<B>,
    script: CommandScript,
    groups: GroupTable,
    calibration: Option<CommandScript>,
    runtime: Option<Arc<RuntimeSchedule>>,
    command_receiver: Receiver<BusCommand>,
    message_sender: Sender<BusMessage>,
    running: Arc<AtomicBool>,
}

impl<B: SerialBus + 'static> BusWorker<B> {
    /// Create a worker and its client. Fails if the script's groups do not
    /// index cleanly.
    pub fn new(interpreter: BusInterpreter<B>, script: CommandScript) -> Result<(Self, BusClient)> {
        let groups = script.index_groups()?;
        let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
        // Replies are best effort; a full channel drops them instead of
        // stalling the bus
        let (msg_tx, msg_rx) = bounded(256);

        let worker = Self {
            interpreter,
            script,
            groups,
            calibration: None,
            runtime: None,
            command_receiver: cmd_rx,
            message_sender: msg_tx,
            running: Arc::new(AtomicBool::new(true)),
        };
        let client = BusClient {
            receiver: msg_rx,
            command_sender: cmd_tx,
        };
        Ok((worker, client))
    }

    /// Sensor calibration applied after the default pass
    pub fn with_calibration(mut self, calibration: CommandScript) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<RuntimeSchedule>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn interpreter(&self) -> &BusInterpreter<B> {
        &self.interpreter
    }

    /// Presets, then the default pass, then calibration
    pub fn bring_up(&mut self) -> Result<ExecutionReport> {
        let presets = self.interpreter.process_initial(&mut self.script)?;
        let defaults = self.interpreter.process_default(&mut self.script)?;
        let mut total = merge(presets, defaults);
        if let Some(calibration) = self.calibration.as_mut() {
            let report = self
                .interpreter
                .process_default(calibration)
                .map_err(|e| e.with_context("apply sensor calibration"))?;
            total = merge(total, report);
        }
        tracing::info!(
            "Bus bring-up done: {} commands executed, {} tolerated failures",
            total.executed,
            total.tolerated_failures
        );
        Ok(total)
    }

    /// Get a handle to stop the worker
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the command loop until shutdown, handing the bus back afterwards
    pub fn run(mut self) -> BusInterpreter<B> {
        tracing::info!("Bus worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.command_receiver.recv_timeout(COMMAND_POLL) {
                Ok(cmd) => self.handle_command(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        self.reply(BusMessage::Shutdown);
        tracing::info!("Bus worker stopped");
        self.interpreter
    }

    pub fn spawn(self) -> Result<JoinHandle<BusInterpreter<B>>> {
        thread::Builder::new()
            .name("bus-worker".into())
            .spawn(move || self.run())
            .map_err(PipelineError::from)
    }

    fn handle_command(&mut self, cmd: BusCommand) {
        let result = match &cmd {
            BusCommand::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
                return;
            }
            BusCommand::Dump(path) => {
                match self.dump(path) {
                    Ok(()) => self.reply(BusMessage::Dumped(path.clone())),
                    Err(e) => self.fail(cmd.clone(), e),
                }
                return;
            }
            BusCommand::RunScript { operation, pass } => {
                let len = self.script.len();
                self.interpreter
                    .execute(&mut self.script, 0..len, *operation, *pass, None)
            }
            BusCommand::ApplyGroup(index) => {
                self.interpreter
                    .process_group(&mut self.script, &self.groups, *index)
            }
            BusCommand::ApplyGroupNamed(name) => {
                self.interpreter
                    .process_group_named(&mut self.script, &self.groups, name)
            }
            BusCommand::ApplyRuntimeSetting(index) => self.apply_runtime_setting(*index),
        };

        match result {
            Ok(report) => {
                tracing::debug!("Bus command {:?} done: {:?}", cmd, report);
                self.reply(BusMessage::Completed {
                    command: cmd,
                    report,
                });
            }
            Err(e) => self.fail(cmd, e),
        }
    }

    fn apply_runtime_setting(&mut self, index: usize) -> Result<ExecutionReport> {
        let setting = self
            .runtime
            .as_ref()
            .and_then(|schedule| schedule.get(index))
            .ok_or_else(|| PipelineError::Config(format!("no runtime setting {index}")))?;
        let mut script = setting.script.clone();
        tracing::debug!("Applying runtime setting {} ({})", index, setting.tag);
        self.interpreter.process_default(&mut script)
    }

    /// Read back copies of the scripts so stored write values stay intact
    fn dump(&mut self, path: &std::path::Path) -> Result<()> {
        let mut main = self.script.clone();
        self.interpreter.read_back(&mut main)?;

        let mut calibration = self.calibration.clone().unwrap_or_default();
        if !calibration.is_empty() {
            self.interpreter.read_back(&mut calibration)?;
        }
        dump::dump_to_file(path, &[("script", &main), ("calibration", &calibration)])
    }

    fn fail(&self, command: BusCommand, error: PipelineError) {
        tracing::error!("Bus command {:?} failed: {}", command, error);
        self.reply(BusMessage::Failed {
            command,
            error: error.to_string(),
        });
    }

    fn reply(&self, message: BusMessage) {
        if let Err(TrySendError::Full(dropped)) = self.message_sender.try_send(message) {
            tracing::debug!("Bus reply channel full, dropping {:?}", dropped);
        }
    }
}

fn merge(a: ExecutionReport, b: ExecutionReport) -> ExecutionReport {
    ExecutionReport {
        executed: a.executed + b.executed,
        skipped: a.skipped + b.skipped,
        tolerated_failures: a.tolerated_failures + b.tolerated_failures,
        verify_mismatches: a.verify_mismatches + b.verify_mismatches,
    }
}
