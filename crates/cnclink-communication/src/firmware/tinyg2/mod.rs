//! TinyG2 / g2core controller: send/response streaming with planner-queue
//! gating over the line-framed JSON protocol.

pub mod command_creator;
pub mod controller;
pub mod response_parser;

pub use command_creator::{classify, wrap_gcode, LineNumberer, SenderMode};
pub use controller::Tinyg2Machine;
pub use response_parser::{Tinyg2Event, Tinyg2MachineState, Tinyg2Parser};
