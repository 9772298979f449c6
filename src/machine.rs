// Wires CPU + memory + BIOS + BDOS + CCP + virtual disk together and
// drives the whole personality. This is the one place that understands
// the full page-zero/TPA/FCB layout and the runaway guard that protects
// a `.COM` file from looping forever.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::bdos::Bdos;
use crate::bios::{self, Bios, BIOS_BASE};
use crate::ccp::{Ccp, CcpAction};
use crate::disk::VirtualDisk;
use crate::error::{CrateError, Result};
use crate::fcb::FCB_SIZE;
use crate::terminal::Terminal;

/// A single RET instruction (`0xC9`), per §4.7: BDOS_BASE holds nothing
/// but this, since BDOS dispatch itself happens through interception of
/// `CALL 0x0005` and never actually falls through to executing code here.
pub const BDOS_BASE: u16 = 0xEC00;
pub const TPA_START: u16 = 0x0100;
pub const FCB1_ADDR: u16 = 0x005C;
pub const FCB2_ADDR: u16 = 0x006C;
pub const DEFAULT_DMA: u16 = 0x0080;

/// Instruction budget for a `.COM` file before the runaway guard kicks
/// in; a defensive exit, not a normal condition.
const RUNAWAY_LIMIT: u64 = 100_000_000;

pub type ProgramHandler = Box<dyn FnMut(&mut VirtualDisk, &mut dyn Terminal, &str)>;

pub struct Machine<'a> {
    pub cpu: crate::cpu::Cpu<'a>,
    disk: Rc<RefCell<VirtualDisk>>,
    terminal: Rc<RefCell<dyn Terminal>>,
    ccp: Ccp,
    registered: Rc<RefCell<HashMap<String, ProgramHandler>>>,
    /// `Arc`, not `Rc`: this is the one piece of Machine state a session's
    /// owning thread needs to reach from outside, so it has to be `Send`
    /// even though everything else here (Cpu, VirtualDisk, Terminal) is
    /// confined to the thread that constructed this Machine.
    shutdown: Arc<AtomicBool>,
}

impl<'a> Machine<'a> {
    /// Builds a Machine with its own private shutdown flag. Nothing outside
    /// this Machine can ever signal it, which is fine for a one-shot CLI run
    /// but wrong for a session that a different thread needs to be able to
    /// stop — use `with_shutdown` there.
    pub fn new(terminal: Rc<RefCell<dyn Terminal>>) -> Self {
        Self::with_shutdown(terminal, Arc::new(AtomicBool::new(false)))
    }

    /// Builds a Machine whose shutdown flag is the caller's `shutdown`
    /// rather than a private one, so a handle holding the same `Arc` can
    /// signal `start`'s loop and `run_com_file`'s step loop from another
    /// thread.
    pub fn with_shutdown(terminal: Rc<RefCell<dyn Terminal>>, shutdown: Arc<AtomicBool>) -> Self {
        let disk = Rc::new(RefCell::new(VirtualDisk::new()));
        let current_drive = Rc::new(Cell::new(0u8));
        let current_user = Rc::new(Cell::new(0u8));
        let registered: Rc<RefCell<HashMap<String, ProgramHandler>>> =
            Rc::new(RefCell::new(HashMap::new()));

        let ccp = Ccp::new(disk.clone(), terminal.clone(), current_drive.clone());

        let bdos = Rc::new(RefCell::new(Bdos::new(
            disk.clone(),
            terminal.clone(),
            current_drive,
            current_user,
        )));

        let mut cpu = crate::cpu::Cpu::new();

        let bdos_for_hook = bdos.clone();
        let terminal_for_hook = terminal.clone();
        cpu.call_interceptor = Some(Box::new(move |addr, cpu| {
            if addr == 0x0005 {
                trace!(function = cpu.reg.c, de = cpu.reg.de(), "bdos dispatch");
                bdos_for_hook.borrow_mut().dispatch(cpu);
                true
            } else if addr == 0x0000 {
                debug!("warm boot via CALL 0");
                cpu.halted = true;
                true
            } else if addr >= BIOS_BASE {
                let bios = Bios::new();
                bios.dispatch(addr, cpu, &mut *terminal_for_hook.borrow_mut())
            } else {
                false
            }
        }));

        Machine { cpu, disk, terminal, ccp, registered, shutdown }
    }

    /// Registers a program name (matched case-insensitively by the CCP's
    /// transient dispatch) that runs host-side rather than as 8080 code.
    pub fn register_program(&mut self, name: &str, handler: ProgramHandler) {
        self.registered.borrow_mut().insert(name.to_ascii_uppercase(), handler);
    }

    pub fn disk(&self) -> Rc<RefCell<VirtualDisk>> {
        self.disk.clone()
    }

    /// Asks the CCP loop and any in-flight `.COM` execution to stop at
    /// their next poll point. Safe to call from another thread via a
    /// clone of `shutdown_handle`.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Clears memory and (re)installs the BIOS RET sled, the page-zero
    /// vectors, and the single RET at `BDOS_BASE`. Exposed alongside
    /// `run_com_file` so callers that want to drive the CPU directly
    /// (tests, a debugger) can get a freshly-booted machine without going
    /// through `start`'s prompt loop.
    pub fn reset_memory(&mut self) {
        self.cpu.mem.clear();
        bios::install(&mut self.cpu);
        self.write_page_zero();
        self.cpu.mem.write(BDOS_BASE, 0xC9);
    }

    /// Installs the BIOS RET sled, page-zero vectors, and the BDOS_BASE
    /// RET, then runs the CCP prompt loop until `EXIT` or shutdown.
    pub fn start(&mut self) {
        self.reset_memory();

        self.terminal.borrow_mut().write_line("CP/M 2.2 (emulated core)");
        info!("machine started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.ccp.run_one() {
                CcpAction::Exit => break,
                CcpAction::Continue => {}
                CcpAction::RunTransient(command, args) => self.dispatch_transient(&command, &args),
            }
        }
        info!("machine stopped");
    }

    pub fn stop(&self) {
        self.request_shutdown();
    }

    fn write_page_zero(&mut self) {
        self.cpu.mem.write(0x0000, 0xC3);
        self.cpu.mem.write_word(0x0001, BIOS_BASE + bios::OFF_WBOOT);
        self.cpu.mem.write(0x0005, 0xC3);
        self.cpu.mem.write_word(0x0006, BDOS_BASE);
    }

    fn dispatch_transient(&mut self, command: &str, args: &str) {
        if let Some(handler) = self.registered.borrow_mut().get_mut(&command.to_ascii_uppercase()) {
            handler(&mut self.disk.borrow_mut(), &mut *self.terminal.borrow_mut(), args);
            return;
        }
        let filename = crate::ccp::normalize_program_name(command);
        let bytes = self.disk.borrow().read(&filename).map(|b| b.to_vec());
        match bytes {
            Some(bytes) => {
                if let Err(err) = self.run_com_file(&bytes, &filename, args) {
                    warn!(%err, "transient program failed to run");
                }
            }
            None => self.ccp.report_unresolved(command),
        }
    }

    /// Loads `bytes` at `0x0100`, builds the FCBs and command tail from
    /// `args`, and steps the CPU until it halts (or the runaway guard
    /// trips). Never propagates a guest failure past this call: per the
    /// error-handling design, a misbehaving transient just returns to CCP.
    pub fn run_com_file(&mut self, bytes: &[u8], command: &str, args: &str) -> Result<()> {
        if bytes.len() > (BDOS_BASE - TPA_START) as usize {
            return Err(CrateError::ProgramTooLarge(command.to_string()));
        }

        self.write_page_zero();
        self.cpu.mem.load(TPA_START, bytes);

        let mut parts = args.split_whitespace();
        build_fcb(&mut self.cpu.mem, FCB1_ADDR, parts.next().unwrap_or(""));
        build_fcb(&mut self.cpu.mem, FCB2_ADDR, parts.next().unwrap_or(""));
        build_command_tail(&mut self.cpu.mem, args);

        self.cpu.reg.pc = TPA_START;
        self.cpu.reg.sp = BDOS_BASE - 2;
        self.cpu.mem.write_word(self.cpu.reg.sp, 0x0000);
        self.cpu.halted = false;

        let mut steps: u64 = 0;
        while !self.cpu.halted {
            if self.shutdown.load(Ordering::SeqCst) {
                self.cpu.halted = true;
                break;
            }
            self.cpu.step();
            steps += 1;
            // A plain JMP 0 (not a CALL) lands here without ever going
            // through the warm-boot interceptor; treat arriving at page
            // zero as equivalent to the intercepted `CALL 0x0000`.
            if self.cpu.reg.pc == 0x0000 {
                self.cpu.halted = true;
            }
            if steps >= RUNAWAY_LIMIT {
                self.cpu.halted = true;
                return Err(CrateError::RunawayExecution(RUNAWAY_LIMIT));
            }
        }
        Ok(())
    }
}

/// Builds a 36-byte FCB at `addr` from a single command-tail token, per
/// §4.7: optional leading `X:` sets the drive, the rest splits on the
/// first `.` into name/extension, both space-padded.
fn build_fcb(mem: &mut crate::memory::Memory, addr: u16, token: &str) {
    for i in 0..FCB_SIZE {
        mem.write(addr + i, 0);
    }
    if token.is_empty() {
        return;
    }
    let upper = token.to_ascii_uppercase();
    let (drive, rest) = match upper.split_once(':') {
        Some((d, r)) if d.len() == 1 => (d.chars().next(), r),
        _ => (None, upper.as_str()),
    };
    if let Some(letter) = drive {
        mem.write(addr, letter as u8 - b'A' + 1);
    }
    let (name, ext) = match rest.split_once('.') {
        Some((n, e)) => (n, e),
        None => (rest, ""),
    };
    for (i, b) in name.bytes().take(8).enumerate() {
        mem.write(addr + 1 + i as u16, b);
    }
    for i in name.len().min(8)..8 {
        mem.write(addr + 1 + i as u16, b' ');
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        mem.write(addr + 9 + i as u16, b);
    }
    for i in ext.len().min(3)..3 {
        mem.write(addr + 9 + i as u16, b' ');
    }
}

/// Builds the command-tail buffer at `0x0080`: length byte, a leading
/// space, the upper-cased args truncated to 127 bytes, then a NUL.
fn build_command_tail(mem: &mut crate::memory::Memory, args: &str) {
    let mut tail = format!(" {}", args.to_ascii_uppercase());
    if tail.len() > 127 {
        tail.truncate(127);
    }
    mem.write(DEFAULT_DMA, tail.len() as u8);
    for (i, b) in tail.bytes().enumerate() {
        mem.write(DEFAULT_DMA + 1 + i as u16, b);
    }
    mem.write(DEFAULT_DMA + 1 + tail.len() as u16, 0);
}
