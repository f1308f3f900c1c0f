//! Grbl-family controller: character-counting streaming over the Grbl text
//! protocol, with runtime Smoothieware recognition.

pub mod controller;
pub mod error_decoder;
pub mod response_parser;

pub use controller::GrblMachine;
pub use response_parser::{GrblEvent, GrblMachineState, GrblParser};
