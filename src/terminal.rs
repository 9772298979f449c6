// Console I/O abstraction BIOS's CONSOLE group is built on. CP/M talks to
// its console one character at a time with a non-blocking status check
// (CONST) ahead of every read, which is why this is a trait rather than
// a bare `Read`/`Write` pair: something has to answer "is there a
// character waiting?" without blocking.

use std::io::{self, Write};
use termion::raw::{IntoRawMode, RawTerminal};

pub trait Terminal {
    /// Non-blocking: `true` if a character is available to `read_char`.
    fn has_input(&mut self) -> bool;
    /// Blocks until a character is available.
    fn read_char(&mut self) -> u8;
    fn write_char(&mut self, byte: u8);

    fn write_str(&mut self, s: &str) {
        for b in s.bytes() {
            self.write_char(b);
        }
    }

    fn write_line(&mut self, s: &str) {
        self.write_str(s);
        self.write_char(b'\r');
        self.write_char(b'\n');
    }

    /// A simple line editor: echoes input, handles backspace/DEL, and
    /// terminates on CR or LF without including it in the result. This is
    /// host-side convenience; BDOS's own line-read function (10) does its
    /// own non-echoing variant since real CP/M software expects to control
    /// echo itself.
    fn read_line(&mut self, max_len: usize) -> String {
        let mut buf = Vec::new();
        loop {
            let b = self.read_char();
            match b {
                b'\r' | b'\n' => {
                    self.write_char(b'\r');
                    self.write_char(b'\n');
                    break;
                }
                0x08 | 0x7f => {
                    if buf.pop().is_some() {
                        self.write_char(0x08);
                        self.write_char(b' ');
                        self.write_char(0x08);
                    }
                }
                _ => {
                    if buf.len() < max_len {
                        buf.push(b);
                        self.write_char(b);
                    }
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }
}

/// Drives a real terminal in raw mode via `termion`, with a background
/// thread feeding a byte channel so `has_input`/`read_char` can be
/// non-blocking without polling the OS on every BDOS console check.
pub struct RawTerminal8080 {
    _raw: RawTerminal<io::Stdout>,
    rx: std::sync::mpsc::Receiver<u8>,
    pending: Option<u8>,
}

impl RawTerminal8080 {
    pub fn new() -> io::Result<Self> {
        let raw = io::stdout().into_raw_mode()?;
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            use std::io::Read;
            let mut stdin = io::stdin();
            let mut byte = [0u8; 1];
            loop {
                match stdin.read(&mut byte) {
                    Ok(1) => {
                        if tx.send(byte[0]).is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        Ok(RawTerminal8080 { _raw: raw, rx, pending: None })
    }

    fn fill_pending(&mut self) {
        if self.pending.is_none() {
            self.pending = self.rx.try_recv().ok();
        }
    }
}

impl Terminal for RawTerminal8080 {
    fn has_input(&mut self) -> bool {
        self.fill_pending();
        self.pending.is_some()
    }

    fn read_char(&mut self) -> u8 {
        loop {
            self.fill_pending();
            if let Some(byte) = self.pending.take() {
                return byte;
            }
            std::thread::yield_now();
        }
    }

    fn write_char(&mut self, byte: u8) {
        let mut out = io::stdout();
        let _ = out.write_all(&[byte]);
        let _ = out.flush();
    }
}

/// A headless terminal fed from a pre-seeded buffer and recording all
/// output, for the end-to-end tests and for session input queues that
/// feed characters in from a network connection rather than a real tty.
#[derive(Default)]
pub struct BufferedTerminal {
    input: std::collections::VecDeque<u8>,
    pub output: Vec<u8>,
}

impl BufferedTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn output_as_string(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}

impl Terminal for BufferedTerminal {
    fn has_input(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn read_char(&mut self) -> u8 {
        self.input.pop_front().unwrap_or(0)
    }

    fn write_char(&mut self, byte: u8) {
        self.output.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_terminal_reports_input_availability() {
        let mut term = BufferedTerminal::new();
        assert!(!term.has_input());
        term.feed(b"A");
        assert!(term.has_input());
        assert_eq!(term.read_char(), b'A');
        assert!(!term.has_input());
    }

    #[test]
    fn buffered_terminal_records_written_bytes() {
        let mut term = BufferedTerminal::new();
        term.write_char(b'O');
        term.write_char(b'K');
        assert_eq!(term.output_as_string(), "OK");
    }

    #[test]
    fn read_line_handles_backspace_and_terminates_on_cr() {
        let mut term = BufferedTerminal::new();
        term.feed(b"HEY\x08LO\r");
        let line = term.read_line(127);
        assert_eq!(line, "HELO");
    }

    #[test]
    fn read_line_truncates_past_max_len() {
        let mut term = BufferedTerminal::new();
        term.feed(b"ABCDE\r");
        let line = term.read_line(3);
        assert_eq!(line, "ABC");
    }
}
