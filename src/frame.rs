//! MODBUS RTU frame views and the byte-level codec.
//!
//! Two views cover the two directions on the bus: [`RequestFrame`] is what a
//! master transmits and a slave parses, [`ResponseFrame`] is what a slave
//! transmits and a master parses. Both are plain byte buffers with typed
//! accessors over the header bytes; every 16-bit field is split and
//! recombined explicitly because MODBUS is big-endian on the wire no matter
//! what the host architecture does.
//!
//! ## Wire layout
//!
//! Request: `unit | fc | addr hi | addr lo | qty hi | qty lo | [count, data...] | crc lo | crc hi`
//! (the bracketed part only for the multi-write function codes; for single
//! writes the quantity field carries the value).
//!
//! Read response: `unit | fc | count | data... | crc lo | crc hi`.
//! Write acknowledgement: the first six request bytes, re-CRC'd.
//! Exception: `unit | fc|0x80 | code | crc lo | crc hi`.

use crate::command::Command;
use crate::crc::crc16;
use crate::fifo::RxFifo;

/// Largest RTU frame on the wire: unit id, function, 252 data bytes, CRC.
pub const MAX_FRAME_LEN: usize = 260;

/// Header bytes common to every request: unit id, function, address, quantity.
pub const REQUEST_HEADER_LEN: usize = 6;

/// Header bytes of a read response: unit id, function, byte count.
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Shortest valid request including CRC.
pub const MIN_REQUEST_LEN: usize = 8;

/// Shortest valid response including CRC.
pub const MIN_RESPONSE_LEN: usize = 6;

/// The function codes this engine implements.
#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Read operations carry a byte-counted payload in their response.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }
}

/// Exception codes defined by the MODBUS application protocol.
#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction = 1,
    IllegalDataAddress = 2,
    InvalidDataValue = 3,
    DeviceFailure = 4,
    Acknowledge = 5,
    Busy = 6,
}

/// Errors raised while decoding a frame.
///
/// `InvalidFrame` never travels on the wire: a slave drops the offending
/// frame silently and a master reports it through the remote-error callback.
/// Exceptions become exception replies (slave) or arrive decoded (master).
#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Length below minimum, CRC mismatch, or a frame addressed elsewhere.
    InvalidFrame,
    /// A MODBUS exception, either decoded or produced by a handler.
    Exception(Exception),
}

/// A master request as it travels on the wire.
///
/// Stack-local to one encode or decode; the engine never stores one.
pub struct RequestFrame {
    pub len: usize,
    pub raw: [u8; MAX_FRAME_LEN],
}

impl RequestFrame {
    pub fn empty() -> Self {
        Self {
            len: 0,
            raw: [0; MAX_FRAME_LEN],
        }
    }

    /// Build the request a master transmits for `cmd`: six header bytes,
    /// for multi-writes the byte count and payload, then the CRC. For single
    /// writes the quantity field carries the value, per MODBUS convention.
    pub fn from_command(cmd: &Command) -> Self {
        let mut frame = Self::empty();
        frame.raw[0] = cmd.unit_id;
        frame.raw[1] = cmd.function as u8;
        frame.raw[2] = (cmd.address >> 8) as u8;
        frame.raw[3] = (cmd.address & 0xFF) as u8;
        frame.raw[4] = (cmd.length >> 8) as u8;
        frame.raw[5] = (cmd.length & 0xFF) as u8;
        frame.len = REQUEST_HEADER_LEN;

        if let FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters =
            cmd.function
        {
            frame.raw[6] = cmd.payload.len() as u8;
            frame.raw[7..7 + cmd.payload.len()].copy_from_slice(&cmd.payload);
            frame.len += 1 + cmd.payload.len();
        }

        frame.push_crc();
        frame
    }

    /// Pull the pending reception out of `fifo` into a fresh frame.
    pub fn drain<const N: usize>(fifo: &mut RxFifo<N>) -> Self {
        let mut frame = Self::empty();
        frame.len = fifo.drain_into(&mut frame.raw);
        frame
    }

    pub fn unit_id(&self) -> u8 {
        self.raw[0]
    }

    /// Raw function code byte; may be outside the supported set.
    pub fn function_byte(&self) -> u8 {
        self.raw[1]
    }

    pub fn function(&self) -> Option<FunctionCode> {
        FunctionCode::from_u8(self.raw[1])
    }

    pub fn address(&self) -> u16 {
        u16::from_be_bytes([self.raw[2], self.raw[3]])
    }

    /// Register or bit count; carries the value for single-write requests.
    pub fn quantity(&self) -> u16 {
        u16::from_be_bytes([self.raw[4], self.raw[5]])
    }

    /// Payload byte count of a multi-write request.
    pub fn byte_count(&self) -> u8 {
        self.raw[6]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.len]
    }

    /// Check a drained reception against the engine's own bus address.
    ///
    /// Frames shorter than the minimum, addressed elsewhere, or failing the
    /// CRC are invalid and must not be answered. An unsupported function
    /// code is an exception the peer gets told about.
    pub fn validate(&self, unit_id: u8) -> Result<FunctionCode, Error> {
        if self.len < MIN_REQUEST_LEN || self.unit_id() != unit_id {
            return Err(Error::InvalidFrame);
        }

        let function = self
            .function()
            .ok_or(Error::Exception(Exception::IllegalFunction))?;

        // The CRC covers the header plus, for multi-writes, the byte count
        // and the payload it announces
        let covered = match function {
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                REQUEST_HEADER_LEN + 1 + self.byte_count() as usize
            }
            _ => REQUEST_HEADER_LEN,
        };

        check_crc(&self.raw, self.len, covered)?;
        Ok(function)
    }

    fn push_crc(&mut self) {
        let crc = crc16(&self.raw[..self.len]);
        self.raw[self.len] = (crc >> 8) as u8;
        self.raw[self.len + 1] = (crc & 0xFF) as u8;
        self.len += 2;
    }
}

/// A slave response as it travels on the wire.
///
/// Like [`RequestFrame`], stack-local to one encode or decode.
pub struct ResponseFrame {
    pub len: usize,
    pub raw: [u8; MAX_FRAME_LEN],
}

impl ResponseFrame {
    pub fn empty() -> Self {
        Self {
            len: 0,
            raw: [0; MAX_FRAME_LEN],
        }
    }

    /// Start a read response: unit id, function code, zeroed byte count.
    /// Payload appenders grow it; [`Self::push_crc`] finishes it.
    pub fn read_header(unit_id: u8, function: FunctionCode) -> Self {
        let mut frame = Self::empty();
        frame.raw[0] = unit_id;
        frame.raw[1] = function as u8;
        frame.raw[2] = 0;
        frame.len = RESPONSE_HEADER_LEN;
        frame
    }

    /// A write acknowledgement echoes the six request header bytes. For
    /// single writes this reproduces the request byte for byte, CRC included.
    pub fn echo(request: &RequestFrame) -> Self {
        let mut frame = Self::empty();
        frame.raw[..REQUEST_HEADER_LEN].copy_from_slice(&request.raw[..REQUEST_HEADER_LEN]);
        frame.len = REQUEST_HEADER_LEN;
        frame.push_crc();
        frame
    }

    /// Exception reply: the request's function code with bit 7 set, then the
    /// exception code. Total length five bytes.
    pub fn exception(request: &RequestFrame, exception: Exception) -> Self {
        let mut frame = Self::empty();
        frame.raw[0] = request.unit_id();
        frame.raw[1] = 0x80 | request.function_byte();
        frame.raw[2] = exception as u8;
        frame.len = RESPONSE_HEADER_LEN;
        frame.push_crc();
        frame
    }

    /// Pull the pending reception out of `fifo` into a fresh frame.
    pub fn drain<const N: usize>(fifo: &mut RxFifo<N>) -> Self {
        let mut frame = Self::empty();
        frame.len = fifo.drain_into(&mut frame.raw);
        frame
    }

    pub fn unit_id(&self) -> u8 {
        self.raw[0]
    }

    pub fn function_byte(&self) -> u8 {
        self.raw[1]
    }

    pub fn function(&self) -> Option<FunctionCode> {
        FunctionCode::from_u8(self.raw[1])
    }

    /// Payload byte count of a read response. The same slot carries the
    /// exception code in an exception reply.
    pub fn byte_count(&self) -> u8 {
        self.raw[2]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw[..self.len]
    }

    /// Check a drained slave response (master role). Length rule depends on
    /// the function code: read responses are sized by their byte count,
    /// write acknowledgements are fixed at six bytes plus CRC.
    pub fn validate(&self) -> Result<FunctionCode, Error> {
        if self.len < MIN_RESPONSE_LEN {
            return Err(Error::InvalidFrame);
        }

        let function = self
            .function()
            .ok_or(Error::Exception(Exception::IllegalFunction))?;

        let covered = if function.is_read() {
            RESPONSE_HEADER_LEN + self.byte_count() as usize
        } else {
            REQUEST_HEADER_LEN
        };

        check_crc(&self.raw, self.len, covered)?;
        Ok(function)
    }

    /// Append one bit to a bit-packed payload. Every eighth bit opens a
    /// fresh payload byte, zeroed first since the buffer may hold stale
    /// data, and bumps the byte count.
    pub fn append_bit(&mut self, value: u16, index: u16) {
        if index % 8 == 0 {
            self.raw[self.len] = 0;
            self.len += 1;
            self.raw[2] += 1;
        }
        self.raw[self.len - 1] |= ((value & 0x01) as u8) << (index % 8);
    }

    /// Append one register as a big-endian word.
    pub fn append_word(&mut self, value: u16) {
        self.raw[self.len] = (value >> 8) as u8;
        self.raw[self.len + 1] = (value & 0xFF) as u8;
        self.len += 2;
        self.raw[2] += 2;
    }

    /// Bit at `index` across the packed payload, zero-extended.
    pub fn bit_at(&self, index: u16) -> u16 {
        let byte = RESPONSE_HEADER_LEN + index as usize / 8;
        if byte >= MAX_FRAME_LEN {
            return 0;
        }
        ((self.raw[byte] >> (index % 8)) & 0x01) as u16
    }

    /// Big-endian word at register `index` past the header.
    pub fn word_at(&self, index: u16) -> u16 {
        let hi = RESPONSE_HEADER_LEN + index as usize * 2;
        if hi + 1 >= MAX_FRAME_LEN {
            return 0;
        }
        u16::from_be_bytes([self.raw[hi], self.raw[hi + 1]])
    }

    pub fn push_crc(&mut self) {
        let crc = crc16(&self.raw[..self.len]);
        self.raw[self.len] = (crc >> 8) as u8;
        self.raw[self.len + 1] = (crc & 0xFF) as u8;
        self.len += 2;
    }
}

/// Compare the CRC over `raw[..covered]` with the two trailing bytes.
fn check_crc(raw: &[u8; MAX_FRAME_LEN], len: usize, covered: usize) -> Result<(), Error> {
    // The announced length must leave room for the trailer itself
    if covered + 2 > len {
        return Err(Error::InvalidFrame);
    }
    let crc = crc16(&raw[..covered]);
    let received = u16::from_be_bytes([raw[covered], raw[covered + 1]]);
    if crc != received {
        return Err(Error::InvalidFrame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn frame_from(bytes: &[u8]) -> RequestFrame {
        let mut frame = RequestFrame::empty();
        frame.raw[..bytes.len()].copy_from_slice(bytes);
        frame.len = bytes.len();
        frame
    }

    fn response_from(bytes: &[u8]) -> ResponseFrame {
        let mut frame = ResponseFrame::empty();
        frame.raw[..bytes.len()].copy_from_slice(bytes);
        frame.len = bytes.len();
        frame
    }

    #[test]
    fn test_encode_read_request() {
        let cmd = Command::read_holding_registers(0x11, 0x006B, 3);
        let frame = RequestFrame::from_command(&cmd);
        assert_eq!(
            frame.bytes(),
            &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]
        );
    }

    #[test]
    fn test_encoded_request_round_trips() {
        let cmd = Command::read_input_registers(0x2A, 0x1234, 0x0010);
        let frame = RequestFrame::from_command(&cmd);

        assert_eq!(frame.validate(0x2A), Ok(FunctionCode::ReadInputRegisters));
        assert_eq!(frame.unit_id(), 0x2A);
        assert_eq!(frame.address(), 0x1234);
        assert_eq!(frame.quantity(), 0x0010);
    }

    #[test]
    fn test_encode_multi_coil_write_request() {
        let bits = [
            true, false, true, true, false, false, true, true, true, false,
        ];
        let cmd = Command::write_multiple_coils(0x11, 0x0013, &bits);
        let frame = RequestFrame::from_command(&cmd);

        assert_eq!(
            &frame.raw[..frame.len - 2],
            &[0x11, 0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
        assert_eq!(frame.validate(0x11), Ok(FunctionCode::WriteMultipleCoils));
    }

    #[test]
    fn test_encoded_multi_register_write_round_trips() {
        let cmd = Command::write_multiple_registers(0x11, 0x0001, &[0x000A, 0x0102]);
        let frame = RequestFrame::from_command(&cmd);

        assert_eq!(
            frame.validate(0x11),
            Ok(FunctionCode::WriteMultipleRegisters)
        );
        assert_eq!(frame.address(), 0x0001);
        assert_eq!(frame.quantity(), 2);
        assert_eq!(frame.byte_count(), 4);
        assert_eq!(&frame.raw[7..11], &[0x00, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_validate_rejects_short_frame() {
        let frame = frame_from(&[0x11, 0x03]);
        assert_eq!(frame.validate(0x11), Err(Error::InvalidFrame));
    }

    #[test]
    fn test_validate_rejects_foreign_address() {
        let frame = frame_from(&[0x22, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]);
        assert_eq!(frame.validate(0x11), Err(Error::InvalidFrame));
    }

    #[test]
    fn test_validate_rejects_bad_crc() {
        let frame = frame_from(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0xFF, 0xFF]);
        assert_eq!(frame.validate(0x11), Err(Error::InvalidFrame));
    }

    #[test]
    fn test_validate_flags_unknown_function() {
        let mut frame = frame_from(&[0x11, 0x07, 0x00, 0x00, 0x00, 0x00]);
        frame.push_crc();
        assert_eq!(
            frame.validate(0x11),
            Err(Error::Exception(Exception::IllegalFunction))
        );
    }

    #[test]
    fn test_validate_multi_write_length_rule() {
        // Write two registers: header + count byte + 4 payload bytes + CRC
        let mut frame = frame_from(&[
            0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02,
        ]);
        frame.push_crc();
        assert_eq!(
            frame.validate(0x11),
            Ok(FunctionCode::WriteMultipleRegisters)
        );

        // A byte count pointing past the reception is invalid
        frame.raw[6] = 0x40;
        assert_eq!(frame.validate(0x11), Err(Error::InvalidFrame));
    }

    #[test]
    fn test_exception_reply_layout() {
        let request = frame_from(&[0x11, 0x05, 0x00, 0xAC, 0x12, 0x34, 0x00, 0x00]);
        let reply = ResponseFrame::exception(&request, Exception::InvalidDataValue);

        assert_eq!(reply.len, 5);
        assert_eq!(reply.raw[0], 0x11);
        assert_eq!(reply.raw[1], 0x85);
        assert_eq!(reply.raw[2], 0x03);
    }

    #[test]
    fn test_echo_reproduces_single_write_request() {
        let request = frame_from(&[0x11, 0x05, 0x00, 0xAC, 0xFF, 0x00, 0x4E, 0x8B]);
        let reply = ResponseFrame::echo(&request);
        assert_eq!(reply.bytes(), request.bytes());
    }

    #[test]
    fn test_word_payload_round_trip() {
        let mut frame = ResponseFrame::read_header(0x11, FunctionCode::ReadHoldingRegisters);
        frame.append_word(0xAE41);
        frame.append_word(0x5652);
        frame.append_word(0x004B);
        frame.push_crc();

        assert_eq!(
            frame.bytes(),
            &[0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x00, 0x4B, 0x39, 0x5A]
        );
        assert_eq!(frame.word_at(0), 0xAE41);
        assert_eq!(frame.word_at(1), 0x5652);
        assert_eq!(frame.word_at(2), 0x004B);
    }

    #[test]
    fn test_bit_payload_round_trip() {
        let mut frame = ResponseFrame::read_header(0x11, FunctionCode::ReadCoils);
        let bits = [1, 0, 1, 1, 0, 0, 1, 1, 1, 0];
        for (index, bit) in bits.iter().enumerate() {
            frame.append_bit(*bit, index as u16);
        }
        frame.push_crc();

        // 10 bits span two payload bytes, LSB first: 0xCD, 0x01
        assert_eq!(frame.byte_count(), 2);
        assert_eq!(frame.raw[3], 0xCD);
        assert_eq!(frame.raw[4], 0x01);
        for (index, bit) in bits.iter().enumerate() {
            assert_eq!(frame.bit_at(index as u16), *bit);
        }
    }

    #[test]
    fn test_response_validate_read() {
        let frame = response_from(&[0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x00, 0x4B, 0x39, 0x5A]);
        assert_eq!(frame.validate(), Ok(FunctionCode::ReadHoldingRegisters));
    }

    #[test]
    fn test_response_validate_write_ack() {
        let mut frame = response_from(&[0x11, 0x10, 0x00, 0x01, 0x00, 0x02]);
        frame.push_crc();
        assert_eq!(frame.validate(), Ok(FunctionCode::WriteMultipleRegisters));
    }

    #[test]
    fn test_response_validate_rejects_short_and_corrupt() {
        let short = response_from(&[0x11, 0x03, 0x02, 0x00, 0x4B]);
        assert_eq!(short.validate(), Err(Error::InvalidFrame));

        let corrupt = response_from(&[0x11, 0x03, 0x02, 0x00, 0x4B, 0xAA, 0xBB]);
        assert_eq!(corrupt.validate(), Err(Error::InvalidFrame));
    }
}
