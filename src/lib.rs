//! An Intel 8080 CPU interpreter wearing a CP/M 2.2 personality: BIOS,
//! BDOS, and a Console Command Processor, plus the host-side plumbing
//! (virtual disk, terminal abstraction, session registry) needed to run
//! `.COM` transient programs without any real hardware underneath.

pub mod bdos;
pub mod bios;
pub mod ccp;
pub mod config;
pub mod cpu;
pub mod disk;
pub mod error;
pub mod fcb;
pub mod machine;
pub mod memory;
pub mod session;
pub mod terminal;

pub use cpu::Cpu;
pub use error::{CrateError, Result};
pub use machine::Machine;
pub use memory::Memory;
