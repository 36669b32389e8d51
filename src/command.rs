//! Commands the application queues when the engine acts as bus master.

use heapless::Vec;

use crate::frame::FunctionCode;

/// Quantity-field value for switching a coil on with a single write.
pub const COIL_ON: u16 = 0xFF00;
/// Quantity-field value for switching a coil off with a single write.
pub const COIL_OFF: u16 = 0x0000;

/// Most coils one multi-write command may carry.
pub const MAX_WRITE_BITS: usize = 1968;
/// Most registers one multi-write command may carry.
pub const MAX_WRITE_WORDS: usize = 123;
/// Payload bytes a full multi-write occupies.
pub const MAX_WRITE_PAYLOAD: usize = 246;

/// One queued master request.
///
/// `length` is the register or bit count for reads and multi-writes; single
/// writes carry the value itself in this field, exactly as the wire format
/// does. Multi-writes keep their data in `payload`, already packed the way
/// the frame transmits it; every other function code leaves it empty. The
/// command is retained as the engine's "last command" after transmission so
/// the reply can be correlated with the addresses that were asked for.
#[derive(Debug, Clone)]
pub struct Command {
    pub function: FunctionCode,
    pub unit_id: u8,
    pub address: u16,
    pub length: u16,
    pub payload: Vec<u8, MAX_WRITE_PAYLOAD>,
}

impl Command {
    pub fn read_coils(unit_id: u8, address: u16, count: u16) -> Self {
        Self {
            function: FunctionCode::ReadCoils,
            unit_id,
            address,
            length: count,
            payload: Vec::new(),
        }
    }

    pub fn read_discrete_inputs(unit_id: u8, address: u16, count: u16) -> Self {
        Self {
            function: FunctionCode::ReadDiscreteInputs,
            unit_id,
            address,
            length: count,
            payload: Vec::new(),
        }
    }

    pub fn read_holding_registers(unit_id: u8, address: u16, count: u16) -> Self {
        Self {
            function: FunctionCode::ReadHoldingRegisters,
            unit_id,
            address,
            length: count,
            payload: Vec::new(),
        }
    }

    pub fn read_input_registers(unit_id: u8, address: u16, count: u16) -> Self {
        Self {
            function: FunctionCode::ReadInputRegisters,
            unit_id,
            address,
            length: count,
            payload: Vec::new(),
        }
    }

    pub fn write_single_coil(unit_id: u8, address: u16, on: bool) -> Self {
        Self {
            function: FunctionCode::WriteSingleCoil,
            unit_id,
            address,
            length: if on { COIL_ON } else { COIL_OFF },
            payload: Vec::new(),
        }
    }

    pub fn write_single_register(unit_id: u8, address: u16, value: u16) -> Self {
        Self {
            function: FunctionCode::WriteSingleRegister,
            unit_id,
            address,
            length: value,
            payload: Vec::new(),
        }
    }

    /// Write `bits` to consecutive coils starting at `address`, packed eight
    /// to a payload byte as on the wire. Bits past the protocol limit are
    /// dropped.
    pub fn write_multiple_coils(unit_id: u8, address: u16, bits: &[bool]) -> Self {
        let count = bits.len().min(MAX_WRITE_BITS);
        let mut payload = Vec::new();
        for (index, bit) in bits[..count].iter().enumerate() {
            if index % 8 == 0 {
                payload.push(0).ok();
            }
            if *bit {
                if let Some(byte) = payload.last_mut() {
                    *byte |= 1 << (index % 8);
                }
            }
        }
        Self {
            function: FunctionCode::WriteMultipleCoils,
            unit_id,
            address,
            length: count as u16,
            payload,
        }
    }

    /// Write `values` to consecutive registers starting at `address`,
    /// big-endian as on the wire. Values past the protocol limit are
    /// dropped.
    pub fn write_multiple_registers(unit_id: u8, address: u16, values: &[u16]) -> Self {
        let count = values.len().min(MAX_WRITE_WORDS);
        let mut payload = Vec::new();
        for value in &values[..count] {
            payload.extend_from_slice(&value.to_be_bytes()).ok();
        }
        Self {
            function: FunctionCode::WriteMultipleRegisters,
            unit_id,
            address,
            length: count as u16,
            payload,
        }
    }
}
