// Typed errors for the host/guest boundary: loading a program, addressing
// a disk file, or driving a session can all fail in ways a caller embedding
// this crate needs to match on. Anything deeper inside CPU execution itself
// never fails; an illegal opcode is handled by falling through as a NOP,
// per the interpreter's contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrateError {
    #[error("disk error: {0}")]
    Disk(#[from] crate::disk::DiskError),

    #[error("program {0} does not fit in the transient program area")]
    ProgramTooLarge(String),

    #[error("no such program registered: {0}")]
    ProgramNotFound(String),

    #[error("session {0} is not running")]
    SessionNotRunning(String),

    #[error("instruction budget of {0} exceeded without the machine halting")]
    RunawayExecution(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for an uncaught systems-level failure surfacing through a
    /// session's terminal as `"System error: <message>"`.
    #[error("{0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, CrateError>;
