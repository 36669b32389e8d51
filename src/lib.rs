//! Transport-agnostic MODBUS RTU protocol engine.
//!
//! One [`Engine`] instance drives one serial bus, acting as either a slave
//! (server) answering requests or a master (client) issuing queued commands
//! and correlating the replies. The engine owns no hardware: the serial
//! driver pushes received bytes in with [`Engine::push_byte`], signals the
//! inter-frame silence with [`Engine::mark_rx_complete`], and supplies a
//! transmit function that puts reply bytes on the wire. The host calls
//! [`Engine::run_task`] from its main loop or an RTOS task; one call does at
//! most one frame's worth of work and never blocks.
//!
//! Register storage stays in the application. Each of the four MODBUS
//! register banks (coils, discrete inputs, holding registers, input
//! registers) is wired up with plain function callbacks, so data can live
//! anywhere and still look like one contiguous register map on the bus.
//!
//! Supported function codes: 0x01-0x06, 0x0F, 0x10.

#![cfg_attr(not(test), no_std)]

pub mod command;
pub mod crc;
pub mod engine;
pub mod fifo;
pub mod frame;
pub mod register;

pub use command::Command;
pub use engine::{Engine, Mode};
pub use frame::{Error, Exception, FunctionCode};
