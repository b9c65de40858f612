//! Events published while monitoring a server.

pub mod sdam;
