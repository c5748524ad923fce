//! # labbridge
//!
//! Device communication layer for the instruments of a coating bench: a
//! mass-flow controller, a heater controller and an ultrasonic atomizer on
//! Modbus RTU, a pulsed power supply on an STX/DLE/ETX framed protocol, a CO2
//! laser controller on single-byte opcodes, a robot-arm PLC on Modbus TCP and
//! an Alicat flow controller on its ASCII line protocol.
//!
//! ## Crate Structure
//!
//! - **`transport`**: one serial port or TCP socket behind the [`transport::Transport`]
//!   trait, with burst reads, per-call timeouts and input draining.
//! - **`codec`**: the five wire protocols. Codecs are stateless apart from
//!   tuning and borrow the transport for each exchange.
//! - **`catalog`**: static register tables per device type. Names, access
//!   modes and ranges are checked here before anything reaches the wire.
//! - **`retry`**: bounded retry and write-then-verify combinators.
//! - **`session`**: one actor task per open device; callers talk to it
//!   through a command queue, so exchanges never interleave.
//! - **`drivers`**: typed operations per instrument built on sessions.
//! - **`sim`**: in-memory instrument models for tests and `--simulate`.
//! - **`config`**, **`logging`**, **`error`**: the ambient stack.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod retry;
pub mod session;
pub mod sim;
pub mod transport;
