//! cnode-core — shared types, wire format, configuration and node identity.
//! All other cnode crates depend on this one.

pub mod config;
pub mod identity;
pub mod wire;

pub use wire::{ArgType, Argument, Command, CommandKind, Signature, WireError};
