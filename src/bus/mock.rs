//! In-memory serial bus for testing
//!
//! [`MemoryBus`] keeps a byte-wide register file per (bus device, device
//! address) pair and implements [`SerialBus`] on top of it, so scripts can
//! be run and inspected without hardware.
//!
//! # Fault injection
//!
//! - [`MemoryBus::fail_open`] - opening a bus device fails
//! - [`MemoryBus::fail_writes_to`] - writes touching a register fail
//! - [`MemoryBus::make_read_only`] - writes to a register are accepted but ignored
//!
//! # Example
//!
//! ```ignore
//! let mut bus = MemoryBus::new();
//! bus.set_register(0, 0x30, 0x3000, 0x24);
//! let mut interp = BusInterpreter::new(bus, 0);
//! interp.read_back(&mut script)?;
//! ```

use super::{BusHandle, RegisterTarget, SerialBus};
use crate::error::{PipelineError, Result};
use std::collections::{HashMap, HashSet};

/// Register file keyed by (bus device, device address, register)
type RegisterKey = (u32, u8, u16);

#[derive(Debug, Default)]
pub struct MemoryBus {
    registers: HashMap<RegisterKey, u8>,
    handles: HashMap<u32, u32>,
    next_handle: u32,
    failing_devices: HashSet<u32>,
    failing_registers: HashSet<(u8, u16)>,
    read_only: HashSet<(u8, u16)>,
    reads: usize,
    writes: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&mut self, device_id: u32, device: u8, register: u16, value: u8) {
        self.registers.insert((device_id, device, register), value);
    }

    /// Current value, `None` if never written
    pub fn register(&self, device_id: u32, device: u8, register: u16) -> Option<u8> {
        self.registers.get(&(device_id, device, register)).copied()
    }

    pub fn fail_open(&mut self, device_id: u32) {
        self.failing_devices.insert(device_id);
    }

    pub fn fail_writes_to(&mut self, device: u8, register: u16) {
        self.failing_registers.insert((device, register));
    }

    pub fn make_read_only(&mut self, device: u8, register: u16) {
        self.read_only.insert((device, register));
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Register writes performed
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Register reads performed
    pub fn reads(&self) -> usize {
        self.reads
    }

    fn device_of(&self, handle: BusHandle) -> Result<u32> {
        self.handles
            .get(&handle.0)
            .copied()
            .ok_or_else(|| PipelineError::bus("access", format!("stale handle {}", handle.0)))
    }
}

impl SerialBus for MemoryBus {
    fn open(&mut self, device_id: u32) -> Result<BusHandle> {
        if self.failing_devices.contains(&device_id) {
            return Err(PipelineError::bus(
                "open",
                format!("bus device {device_id} unavailable"),
            ));
        }
        self.next_handle += 1;
        self.handles.insert(self.next_handle, device_id);
        Ok(BusHandle(self.next_handle))
    }

    fn close(&mut self, handle: BusHandle) {
        self.handles.remove(&handle.0);
    }

    fn read_register(&mut self, handle: BusHandle, target: RegisterTarget, len: usize) -> Result<Vec<u8>> {
        let device_id = self.device_of(handle)?;
        self.reads += 1;
        Ok((0..len)
            .map(|i| {
                let register = target.register.wrapping_add(i as u16);
                self.register(device_id, target.device, register).unwrap_or(0)
            })
            .collect())
    }

    fn write_register(&mut self, handle: BusHandle, target: RegisterTarget, payload: &[u8]) -> Result<()> {
        let device_id = self.device_of(handle)?;
        for i in 0..payload.len() {
            let register = target.register.wrapping_add(i as u16);
            if self.failing_registers.contains(&(target.device, register)) {
                return Err(PipelineError::bus(
                    "write",
                    format!("no ack from {target}"),
                ));
            }
        }
        self.writes += 1;
        for (i, value) in payload.iter().enumerate() {
            let register = target.register.wrapping_add(i as u16);
            if !self.read_only.contains(&(target.device, register)) {
                self.registers.insert((device_id, target.device, register), *value);
            }
        }
        Ok(())
    }
}
