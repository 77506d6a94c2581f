//! Process-level helpers shared by the binary.

pub mod bootstrap;
