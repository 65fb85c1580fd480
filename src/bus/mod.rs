//! Serial-bus register scripting.
//!
//! Sensors and serializers are configured by replaying ordered register
//! scripts over a serial bus. This module contains:
//!
//! - [`SerialBus`] - the bus collaborator (open/close/read/write)
//! - [`script`] - commands, scripts and the group index
//! - [`interpreter`] - replays a script range against a bus
//! - [`parser`] - text register-script format
//! - [`dump`] - register dump writer
//! - [`worker`] - thread that owns the bus and serialises all access to it
//! - [`mock`] - in-memory bus with fault injection
//!
//! # Access model
//!
//! `DeviceSelect` closes and reopens the active handle, so a bus must never
//! be driven from two threads at once. Bring-up runs on the main thread
//! before any stage starts; after that the [`BusWorker`] is the only owner.

pub mod dump;
pub mod interpreter;
pub mod mock;
pub mod parser;
pub mod script;
pub mod worker;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use interpreter::{BusInterpreter, BusOperation, ExecutionReport, InterpreterOptions};
pub use mock::MemoryBus;
pub use script::{Command, CommandKind, CommandScript, Group, GroupTable, ProcessType};
pub use worker::{BusClient, BusCommand, BusMessage, BusWorker};

/// Opaque handle to an opened bus device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(pub u32);

/// Width of a register address on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AddressWidth {
    #[default]
    One,
    Two,
}

impl AddressWidth {
    pub fn bytes(&self) -> usize {
        match self {
            AddressWidth::One => 1,
            AddressWidth::Two => 2,
        }
    }
}

/// Register on an addressed peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RegisterTarget {
    /// 7-bit device address
    pub device: u8,
    pub register: u16,
    pub width: AddressWidth,
}

impl RegisterTarget {
    pub fn new(device: u8, register: u16, width: AddressWidth) -> Self {
        Self {
            device,
            register,
            width,
        }
    }

    /// Register address as sent on the wire, big-endian
    pub fn address_bytes(&self) -> Vec<u8> {
        match self.width {
            AddressWidth::One => vec![self.register as u8],
            AddressWidth::Two => self.register.to_be_bytes().to_vec(),
        }
    }

    /// Same device, register advanced by `offset`
    pub fn offset(&self, offset: u16) -> Self {
        Self {
            register: self.register.wrapping_add(offset),
            ..*self
        }
    }
}

impl fmt::Display for RegisterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.width {
            AddressWidth::One => write!(f, "{:02x}:{:02x}", self.device, self.register),
            AddressWidth::Two => write!(f, "{:02x}:{:04x}", self.device, self.register),
        }
    }
}

/// Serial bus collaborator
#[cfg_attr(test, mockall::automock)]
pub trait SerialBus: Send {
    /// Open bus device `device_id`
    fn open(&mut self, device_id: u32) -> Result<BusHandle>;

    fn close(&mut self, handle: BusHandle);

    /// Read `len` bytes starting at `target`
    fn read_register(&mut self, handle: BusHandle, target: RegisterTarget, len: usize) -> Result<Vec<u8>>;

    /// Write `payload` starting at `target`
    fn write_register(&mut self, handle: BusHandle, target: RegisterTarget, payload: &[u8]) -> Result<()>;
}

impl<B: SerialBus + ?Sized> SerialBus for Box<B> {
    fn open(&mut self, device_id: u32) -> Result<BusHandle> {
        (**self).open(device_id)
    }

    fn close(&mut self, handle: BusHandle) {
        (**self).close(handle)
    }

    fn read_register(&mut self, handle: BusHandle, target: RegisterTarget, len: usize) -> Result<Vec<u8>> {
        (**self).read_register(handle, target, len)
    }

    fn write_register(&mut self, handle: BusHandle, target: RegisterTarget, payload: &[u8]) -> Result<()> {
        (**self).write_register(handle, target, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bytes() {
        assert_eq!(
            RegisterTarget::new(0x30, 0x3012, AddressWidth::Two).address_bytes(),
            vec![0x30, 0x12]
        );
        assert_eq!(
            RegisterTarget::new(0x40, 0x12, AddressWidth::One).address_bytes(),
            vec![0x12]
        );
    }

    #[test]
    fn test_target_display() {
        let target = RegisterTarget::new(0x30, 0x3012, AddressWidth::Two);
        assert_eq!(target.to_string(), "30:3012");
        assert_eq!(target.offset(2).register, 0x3014);
    }
}
