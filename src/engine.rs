//! The engine handle and the two role state machines.
//!
//! A fresh engine is a slave. The host wires up the transmit callback, the
//! register banks and the bus address, then pumps `push_byte` /
//! `mark_rx_complete` / `tick_rx_timeout` from its interrupt handlers and
//! calls `run_task` from the main loop. Switching to master mode swaps the
//! task the tick executes: instead of answering requests, the engine drains
//! its command queue one request at a time, awaiting each reply before the
//! next command goes out.

use core::sync::atomic::{AtomicU8, Ordering};

use heapless::Deque;

#[cfg(not(test))]
use defmt;

use crate::command::{Command, COIL_OFF, COIL_ON};
use crate::fifo::RxFifo;
use crate::frame::{
    Error, Exception, FunctionCode, RequestFrame, ResponseFrame, MAX_FRAME_LEN,
};
use crate::register::{Layout, ReadFn, RegisterBank, RemoteFn, WriteFn};

/// Pending master commands held between `enqueue_command` and transmission.
pub const COMMAND_QUEUE_DEPTH: usize = 16;

/// Default milliseconds a master waits for a slave response.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u16 = 250;

/// Inter-character receive timeout while operating as a slave, in bit times
/// (1.5 characters of 11 bits).
pub const SLAVE_GAP_BITS: u16 = 17;

/// Inter-character receive timeout while operating as a master, in bit
/// times (3.5 characters of 11 bits).
pub const MASTER_GAP_BITS: u16 = 38;

/// Most registers one read request may ask for.
const MAX_READ_WORDS: u16 = 125;
/// Most bits one read request may ask for.
const MAX_READ_BITS: u16 = 2000;

/// Puts a finished frame on the wire. Invoked synchronously from the task;
/// it must return well within one inter-frame interval.
pub type TransmitFn = fn(&[u8]);

/// Notification without payload (write complete, remote complete, timeout).
pub type EventFn = fn();

/// Notification carrying the decode error of a rejected response.
pub type ErrorEventFn = fn(Error);

#[cfg_attr(not(test), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Master,
    Slave,
}

/// Master task states; one `run_task` call advances at most one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MasterState {
    /// Nothing in flight: pop the next command and transmit it.
    SendIdle,
    /// Request on the wire, reply or timeout pending.
    Await,
    /// A complete reception is waiting to be decoded and delivered.
    Elaborate,
}

/// One MODBUS engine bound to one bus.
pub struct Engine {
    mode: Mode,
    state: MasterState,
    unit_id: Option<&'static AtomicU8>,

    rx: RxFifo<MAX_FRAME_LEN>,
    rx_complete: bool,
    rx_timeout: u16,
    response_timeout_ms: u16,
    gap_bits: u16,

    commands: Deque<Command, COMMAND_QUEUE_DEPTH>,
    last_command: Option<Command>,

    coils: RegisterBank,
    discretes: RegisterBank,
    holdings: RegisterBank,
    inputs: RegisterBank,
    single_write_to_inputs: bool,

    transmit: Option<TransmitFn>,
    on_write_complete: Option<EventFn>,
    on_remote_complete: Option<EventFn>,
    on_remote_error: Option<ErrorEventFn>,
    on_rx_timeout: Option<EventFn>,
}

impl Engine {
    /// A fresh engine starts as a slave with unmapped register banks.
    pub fn new() -> Self {
        Self {
            mode: Mode::Slave,
            state: MasterState::SendIdle,
            unit_id: None,
            rx: RxFifo::new(),
            rx_complete: false,
            rx_timeout: 0,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            gap_bits: SLAVE_GAP_BITS,
            commands: Deque::new(),
            last_command: None,
            coils: RegisterBank::new(Layout::Bits),
            discretes: RegisterBank::new(Layout::Bits),
            holdings: RegisterBank::new(Layout::Words),
            inputs: RegisterBank::new(Layout::Words),
            single_write_to_inputs: false,
            transmit: None,
            on_write_complete: None,
            on_remote_complete: None,
            on_remote_error: None,
            on_rx_timeout: None,
        }
    }

    /// Switch bus roles. Queued master commands are flushed, the master
    /// state machine resets, and the inter-character gap the transport
    /// should enforce changes with the role.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.state = MasterState::SendIdle;
        self.gap_bits = match mode {
            Mode::Master => {
                self.commands.clear();
                MASTER_GAP_BITS
            }
            Mode::Slave => SLAVE_GAP_BITS,
        };
        #[cfg(not(test))]
        defmt::debug!("mode {}, rx gap {} bit times", mode, self.gap_bits);
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bind the bus address. The engine re-reads the binding on every frame,
    /// so the application can change the shared variable at any time and the
    /// next reception already honors it.
    pub fn bind_unit_id(&mut self, unit_id: &'static AtomicU8) {
        self.unit_id = Some(unit_id);
    }

    pub fn unit_id(&self) -> Option<u8> {
        self.unit_id.map(|address| address.load(Ordering::Relaxed))
    }

    /// Milliseconds a master waits for a response before giving up.
    pub fn set_response_timeout(&mut self, ms: u16) {
        self.response_timeout_ms = ms;
    }

    /// Inter-character receive timeout the transport should program for the
    /// current role, in bit times of one 11-bit character.
    pub fn rx_gap_bits(&self) -> u16 {
        self.gap_bits
    }

    pub fn set_transmit(&mut self, tx: TransmitFn) {
        self.transmit = Some(tx);
    }

    /// Route register writes (single and multiple) to the input-register
    /// bank instead of holdings, for devices wired that way.
    pub fn set_single_write_to_inputs(&mut self, enable: bool) {
        self.single_write_to_inputs = enable;
    }

    pub fn set_coils_read(&mut self, read: ReadFn) {
        self.coils.read = read;
    }

    pub fn set_coils_write(&mut self, write: WriteFn) {
        self.coils.write = write;
    }

    pub fn set_coils_remote(&mut self, remote: RemoteFn) {
        self.coils.remote = Some(remote);
    }

    pub fn set_discretes_read(&mut self, read: ReadFn) {
        self.discretes.read = read;
    }

    pub fn set_discretes_remote(&mut self, remote: RemoteFn) {
        self.discretes.remote = Some(remote);
    }

    pub fn set_holdings_read(&mut self, read: ReadFn) {
        self.holdings.read = read;
    }

    pub fn set_holdings_write(&mut self, write: WriteFn) {
        self.holdings.write = write;
    }

    pub fn set_holdings_remote(&mut self, remote: RemoteFn) {
        self.holdings.remote = Some(remote);
    }

    pub fn set_inputs_read(&mut self, read: ReadFn) {
        self.inputs.read = read;
    }

    pub fn set_inputs_write(&mut self, write: WriteFn) {
        self.inputs.write = write;
    }

    pub fn set_inputs_remote(&mut self, remote: RemoteFn) {
        self.inputs.remote = Some(remote);
    }

    pub fn set_write_complete_callback(&mut self, event: EventFn) {
        self.on_write_complete = Some(event);
    }

    pub fn set_remote_complete_callback(&mut self, event: EventFn) {
        self.on_remote_complete = Some(event);
    }

    pub fn set_remote_error_callback(&mut self, event: ErrorEventFn) {
        self.on_remote_error = Some(event);
    }

    pub fn set_rx_timeout_callback(&mut self, event: EventFn) {
        self.on_rx_timeout = Some(event);
    }

    /// Store one received byte; call from the receive interrupt.
    pub fn push_byte(&mut self, byte: u8) {
        self.rx.push(byte);
    }

    /// Signal the end-of-frame silence. Honored while a slave, or while a
    /// master sits in the awaiting-reply state; a late reply landing in any
    /// other state is ignored so it cannot contaminate the next command.
    pub fn mark_rx_complete(&mut self) {
        if self.mode == Mode::Slave || self.state == MasterState::Await {
            self.rx_complete = true;
        }
    }

    pub fn rx_complete(&self) -> bool {
        self.rx_complete
    }

    /// True when a receive interrupt ever evicted an unread byte. Diagnostic
    /// only: an overflowed reception fails its CRC check and is dropped.
    pub fn rx_overflowed(&self) -> bool {
        self.rx.overflowed()
    }

    /// Count the response timeout down; call from a 1 ms timer. Only the
    /// awaiting-reply state consumes the counter.
    pub fn tick_rx_timeout(&mut self) {
        if self.rx_timeout != 0 && self.mode == Mode::Master && self.state == MasterState::Await {
            self.rx_timeout -= 1;
        }
    }

    /// Queue one master request. A full queue rejects the command and hands
    /// it back to the caller.
    pub fn enqueue_command(&mut self, cmd: Command) -> Result<(), Command> {
        self.commands.push_back(cmd)
    }

    /// Advance the engine by at most one frame's worth of work. Call
    /// periodically from the host main loop or an RTOS task; never blocks.
    pub fn run_task(&mut self) {
        match self.mode {
            Mode::Slave => self.slave_task(),
            Mode::Master => match self.state {
                MasterState::SendIdle => self.master_send(),
                MasterState::Await => self.master_await(),
                MasterState::Elaborate => self.master_elaborate(),
            },
        }
    }

    fn slave_task(&mut self) {
        if !self.rx_complete {
            return;
        }
        self.rx_complete = false;

        let request = RequestFrame::drain(&mut self.rx);
        let unit_id = match self.unit_id() {
            Some(id) => id,
            // No address bound yet: nothing on the bus can be for us
            None => return,
        };

        let reply = match request.validate(unit_id) {
            Ok(function) => self.execute(&request, function),
            // Corrupt or foreign frames never get an answer
            Err(Error::InvalidFrame) => {
                #[cfg(not(test))]
                defmt::warn!("dropping invalid frame, {} bytes", request.len);
                return;
            }
            Err(Error::Exception(exception)) => {
                #[cfg(not(test))]
                defmt::warn!("request rejected: {}", exception);
                ResponseFrame::exception(&request, exception)
            }
        };

        self.send(reply.bytes());
    }

    /// Dispatch a validated request and build the reply. The write-complete
    /// event fires only when a write reply echoes the function code
    /// unmodified; exception replies carry it with bit 7 set.
    fn execute(&self, request: &RequestFrame, function: FunctionCode) -> ResponseFrame {
        let reply = match function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => self.read_registers(request, function),
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                self.write_single(request, function)
            }
            FunctionCode::WriteMultipleCoils => self.write_multiple_coils(request),
            FunctionCode::WriteMultipleRegisters => self.write_multiple_registers(request),
        };

        if function.is_write() && reply.function_byte() == function as u8 {
            if let Some(event) = self.on_write_complete {
                event();
            }
        }
        reply
    }

    fn read_registers(&self, request: &RequestFrame, function: FunctionCode) -> ResponseFrame {
        let address = request.address();
        let quantity = request.quantity();
        let bank = self.bank_for(function);

        let limit = match bank.layout {
            Layout::Bits => MAX_READ_BITS,
            Layout::Words => MAX_READ_WORDS,
        };
        if quantity == 0 || quantity > limit {
            return ResponseFrame::exception(request, Exception::InvalidDataValue);
        }

        let mut reply = ResponseFrame::read_header(request.unit_id(), function);
        for index in 0..quantity {
            match (bank.read)(address.wrapping_add(index)) {
                Ok(value) => bank.layout.append(&mut reply, value, index),
                // Partial payload is discarded with the frame
                Err(exception) => return ResponseFrame::exception(request, exception),
            }
        }
        reply.push_crc();
        reply
    }

    fn write_single(&self, request: &RequestFrame, function: FunctionCode) -> ResponseFrame {
        let address = request.address();
        // The quantity field carries the value for single writes
        let mut value = request.quantity();

        let bank = match function {
            FunctionCode::WriteSingleCoil => {
                value = match value {
                    COIL_ON => 1,
                    COIL_OFF => 0,
                    _ => return ResponseFrame::exception(request, Exception::InvalidDataValue),
                };
                &self.coils
            }
            _ => self.write_bank(),
        };

        match (bank.write)(address, value) {
            Ok(()) => ResponseFrame::echo(request),
            Err(exception) => ResponseFrame::exception(request, exception),
        }
    }

    fn write_multiple_coils(&self, request: &RequestFrame) -> ResponseFrame {
        let address = request.address();
        let quantity = request.quantity();

        if quantity == 0 || request.byte_count() as usize != (quantity as usize + 7) / 8 {
            return ResponseFrame::exception(request, Exception::InvalidDataValue);
        }

        for index in 0..quantity {
            // Payload bits start at byte 7 of the request, eight to a byte
            let byte = 7 + index as usize / 8;
            let bit = (request.raw[byte] >> (index % 8)) & 0x01;
            if let Err(exception) = (self.coils.write)(address.wrapping_add(index), bit as u16) {
                // Bits already written stay written
                return ResponseFrame::exception(request, exception);
            }
        }
        ResponseFrame::echo(request)
    }

    fn write_multiple_registers(&self, request: &RequestFrame) -> ResponseFrame {
        let address = request.address();
        let quantity = request.quantity();
        let bank = self.write_bank();

        if quantity == 0 || request.byte_count() as usize != quantity as usize * 2 {
            return ResponseFrame::exception(request, Exception::InvalidDataValue);
        }

        for index in 0..quantity {
            let offset = 7 + index as usize * 2;
            let value = u16::from_be_bytes([request.raw[offset], request.raw[offset + 1]]);
            if let Err(exception) = (bank.write)(address.wrapping_add(index), value) {
                // Registers already written are not rolled back
                return ResponseFrame::exception(request, exception);
            }
        }
        ResponseFrame::echo(request)
    }

    fn master_send(&mut self) {
        let cmd = match self.commands.pop_front() {
            Some(cmd) => cmd,
            None => return,
        };

        let frame = RequestFrame::from_command(&cmd);
        self.last_command = Some(cmd);

        // Arm the state machine before transmitting: a timer interrupt
        // between the two must see the fresh counter, and the reply can
        // start arriving the moment the request hits the wire
        self.state = MasterState::Await;
        self.rx_timeout = self.response_timeout_ms;

        self.send(frame.bytes());
    }

    fn master_await(&mut self) {
        if self.rx_complete {
            self.rx_complete = false;
            self.state = MasterState::Elaborate;
        } else if self.rx_timeout == 0 {
            #[cfg(not(test))]
            defmt::warn!("response timeout");
            if let Some(event) = self.on_rx_timeout {
                event();
            }
            self.state = MasterState::SendIdle;
        }
    }

    fn master_elaborate(&mut self) {
        let response = ResponseFrame::drain(&mut self.rx);

        match response.validate() {
            Ok(function) => {
                if function.is_read() {
                    if let Some(cmd) = &self.last_command {
                        let bank = self.bank_for(function);
                        for index in 0..cmd.length {
                            let value = bank.layout.read_payload(&response, index);
                            if let Some(remote) = bank.remote {
                                remote(cmd.unit_id, cmd.address.wrapping_add(index), value);
                            }
                        }
                    }
                }
                // Write acknowledgements carry no register data
                if let Some(event) = self.on_remote_complete {
                    event();
                }
            }
            Err(error) => {
                #[cfg(not(test))]
                defmt::warn!("response rejected: {}", error);
                if let Some(event) = self.on_remote_error {
                    event(error);
                }
            }
        }

        self.state = MasterState::SendIdle;
    }

    fn bank_for(&self, function: FunctionCode) -> &RegisterBank {
        match function {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => &self.coils,
            FunctionCode::ReadDiscreteInputs => &self.discretes,
            FunctionCode::ReadHoldingRegisters => &self.holdings,
            FunctionCode::ReadInputRegisters => &self.inputs,
            FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
                self.write_bank()
            }
        }
    }

    /// Register writes target holdings; the compatibility switch reroutes
    /// them to the inputs bank.
    fn write_bank(&self) -> &RegisterBank {
        if self.single_write_to_inputs {
            &self.inputs
        } else {
            &self.holdings
        }
    }

    fn send(&self, bytes: &[u8]) {
        if let Some(tx) = self.transmit {
            tx(bytes);
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
