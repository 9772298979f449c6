// The Console Command Processor: the prompt loop a user actually types
// at. Built-ins operate directly on the virtual disk and terminal since
// they're host-side conveniences, not guest 8080 code; anything that
// isn't a built-in comes back as `RunTransient` for the Machine to
// resolve, since only it knows about registered programs and how to
// drive the CPU through the `.COM` loader.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::disk::{split_name_ext, VirtualDisk};
use crate::terminal::Terminal;

fn split_command(line: &str) -> (String, String) {
    match line.trim().split_once(' ') {
        Some((cmd, rest)) => (cmd.to_string(), rest.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

/// A bare `X:` command switches the current drive; returns the drive
/// index (0 = A) if `command` has that shape.
fn parse_drive_switch(command: &str) -> Option<u8> {
    let mut chars = command.chars();
    let letter = chars.next()?;
    if chars.next()? != ':' || chars.next().is_some() {
        return None;
    }
    if !letter.is_ascii_alphabetic() {
        return None;
    }
    Some(letter.to_ascii_uppercase() as u8 - b'A')
}

/// Adds `.COM` only when the name carries neither a dot nor a wildcard
/// character, matching the normalization CCP applies before looking a
/// name up as a transient program.
pub fn normalize_program_name(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    if upper.contains('.') || upper.contains('*') || upper.contains('?') {
        upper
    } else {
        format!("{}.COM", upper)
    }
}

fn format_dir_listing(names: &[String]) -> String {
    if names.is_empty() {
        return "No file\r\n".to_string();
    }
    let mut out = String::new();
    for (i, name) in names.iter().enumerate() {
        let (stem, ext) = split_name_ext(name);
        out.push_str(&format!("{:<8} {:<3}", stem, ext));
        let is_last = i + 1 == names.len();
        if (i + 1) % 4 == 0 || is_last {
            out.push_str("\r\n");
        } else {
            out.push_str("  ");
        }
    }
    out
}

/// What the prompt loop should do after reading one line.
#[derive(Debug, PartialEq, Eq)]
pub enum CcpAction {
    /// A built-in ran (or the line was blank); keep looping.
    Continue,
    /// `EXIT` was typed; the session should stop.
    Exit,
    /// Not a recognized built-in — the caller must try the registered
    /// program table and then the disk `.COM` loader.
    RunTransient(String, String),
}

pub struct Ccp {
    disk: Rc<RefCell<VirtualDisk>>,
    terminal: Rc<RefCell<dyn Terminal>>,
    current_drive: Rc<Cell<u8>>,
}

impl Ccp {
    pub fn new(
        disk: Rc<RefCell<VirtualDisk>>,
        terminal: Rc<RefCell<dyn Terminal>>,
        current_drive: Rc<Cell<u8>>,
    ) -> Self {
        Ccp { disk, terminal, current_drive }
    }

    pub fn prompt(&self) -> String {
        format!("{}>", (b'A' + self.current_drive.get()) as char)
    }

    /// Writes the prompt, reads one line, and dispatches it.
    pub fn run_one(&mut self) -> CcpAction {
        let line = {
            let mut term = self.terminal.borrow_mut();
            term.write_str(&self.prompt());
            term.read_line(127)
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return CcpAction::Continue;
        }
        let (command, args) = split_command(trimmed);
        let command_upper = command.to_ascii_uppercase();

        if let Some(drive) = parse_drive_switch(&command_upper) {
            self.current_drive.set(drive);
            return CcpAction::Continue;
        }

        match command_upper.as_str() {
            "EXIT" => return CcpAction::Exit,
            "DIR" => self.builtin_dir(&args),
            "TYPE" => self.builtin_type(&args),
            "ERA" => self.builtin_era(&args),
            "REN" => self.builtin_ren(&args),
            "USER" => {} // user area is tracked by BDOS; nothing to echo here
            "SAVE" => self.terminal.borrow_mut().write_line("SAVE?"),
            _ => return CcpAction::RunTransient(command, args),
        }
        CcpAction::Continue
    }

    /// Reports that `command` resolved to nothing runnable, the message
    /// the Machine shows after failing both the registered-program table
    /// and the disk `.COM` loader.
    pub fn report_unresolved(&mut self, command: &str) {
        self.terminal.borrow_mut().write_line(&format!("{}?", command.to_ascii_uppercase()));
    }

    fn builtin_dir(&mut self, args: &str) {
        let pattern = if args.is_empty() { "*.*".to_string() } else { args.to_ascii_uppercase() };
        let names = self.disk.borrow().list(&pattern);
        let listing = format_dir_listing(&names);
        self.terminal.borrow_mut().write_str(&listing);
    }

    fn builtin_type(&mut self, args: &str) {
        if args.is_empty() {
            self.terminal.borrow_mut().write_line("Type what?");
            return;
        }
        let name = normalize_program_name(args);
        let lines = self.disk.borrow().read_text_lines(&name);
        let mut term = self.terminal.borrow_mut();
        match lines {
            Some(lines) => {
                for line in lines {
                    term.write_line(&line);
                }
            }
            None => term.write_line("No file"),
        }
    }

    fn builtin_era(&mut self, args: &str) {
        if args.is_empty() {
            self.terminal.borrow_mut().write_line("Era what?");
            return;
        }
        let pattern = args.to_ascii_uppercase();
        let names = self.disk.borrow().list(&pattern);
        let mut disk = self.disk.borrow_mut();
        for name in names {
            let _ = disk.delete(&name);
        }
    }

    fn builtin_ren(&mut self, args: &str) {
        match args.split_once('=') {
            Some((new, old)) => {
                let _ = self.disk.borrow_mut().rename(old.trim(), new.trim());
            }
            None => self.terminal.borrow_mut().write_line("Ren what?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::BufferedTerminal;

    fn setup(drive: u8) -> (Ccp, Rc<RefCell<VirtualDisk>>, Rc<RefCell<BufferedTerminal>>) {
        let disk = Rc::new(RefCell::new(VirtualDisk::new()));
        let terminal = Rc::new(RefCell::new(BufferedTerminal::new()));
        let term_dyn: Rc<RefCell<dyn Terminal>> = terminal.clone();
        let current_drive = Rc::new(Cell::new(drive));
        (Ccp::new(disk.clone(), term_dyn, current_drive), disk, terminal)
    }

    #[test]
    fn prompt_reflects_current_drive_letter() {
        let (ccp, _disk, _term) = setup(2);
        assert_eq!(ccp.prompt(), "C>");
    }

    #[test]
    fn dir_lists_four_per_row_with_two_space_gaps() {
        let (mut ccp, disk, term) = setup(0);
        disk.borrow_mut().write("HELLO.COM", vec![0u8; 10]);
        disk.borrow_mut().write("README.TXT", vec![0u8; 20]);
        term.borrow_mut().feed(b"DIR\r");
        ccp.run_one();
        let out = term.borrow().output_as_string();
        assert!(out.contains("HELLO    COM"));
        assert!(out.contains("README   TXT"));
        assert!(out.contains("HELLO    COM  README   TXT"));
    }

    #[test]
    fn dir_with_no_files_prints_no_file() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"DIR\r");
        ccp.run_one();
        assert!(term.borrow().output_as_string().contains("No file"));
    }

    #[test]
    fn bare_drive_letter_switches_current_drive() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"B:\r");
        ccp.run_one();
        assert_eq!(ccp.prompt(), "B>");
    }

    #[test]
    fn exit_stops_the_loop() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"EXIT\r");
        assert_eq!(ccp.run_one(), CcpAction::Exit);
    }

    #[test]
    fn unknown_command_is_reported_as_a_transient_to_run() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"HELLO arg1\r");
        assert_eq!(
            ccp.run_one(),
            CcpAction::RunTransient("HELLO".to_string(), "arg1".to_string())
        );
    }

    #[test]
    fn unresolved_transient_prints_question_mark() {
        let (mut ccp, _disk, term) = setup(0);
        ccp.report_unresolved("nope");
        assert!(term.borrow().output_as_string().contains("NOPE?"));
    }

    #[test]
    fn type_of_missing_file_reports_no_file() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"TYPE GONE.TXT\r");
        ccp.run_one();
        assert!(term.borrow().output_as_string().contains("No file"));
    }

    #[test]
    fn ren_without_equals_reports_ren_what() {
        let (mut ccp, _disk, term) = setup(0);
        term.borrow_mut().feed(b"REN FOO.TXT\r");
        ccp.run_one();
        assert!(term.borrow().output_as_string().contains("Ren what?"));
    }

    #[test]
    fn program_name_gets_com_extension_only_when_bare() {
        assert_eq!(normalize_program_name("hello"), "HELLO.COM");
        assert_eq!(normalize_program_name("hello.txt"), "HELLO.TXT");
        assert_eq!(normalize_program_name("*.com"), "*.COM");
    }
}
