// The BDOS dispatcher: everything guest code reaches via `CALL 0x0005`,
// function number in C, operand in DE, answer in A (and HL for the couple
// of functions that return a word). This is the actual "operating system"
// as far as a `.COM` file is concerned; BIOS below it is just console and
// disk plumbing.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::cpu::Cpu;
use crate::disk::VirtualDisk;
use crate::fcb::Fcb;
use crate::terminal::Terminal;

const RECORD_SIZE: u16 = 128;

struct OpenFile {
    filename: String,
    offset: usize,
}

/// Directory-search state for BDOS functions 17/18 (search-first,
/// search-next), which iterate one matching name per call.
#[derive(Default)]
struct SearchState {
    pattern: String,
    remaining: Vec<String>,
}

pub struct Bdos {
    disk: Rc<RefCell<VirtualDisk>>,
    terminal: Rc<RefCell<dyn Terminal>>,
    pub dma_addr: u16,
    current_drive: Rc<Cell<u8>>,
    current_user: Rc<Cell<u8>>,
    open_files: HashMap<u16, OpenFile>,
    search: SearchState,
}

impl Bdos {
    pub fn new(
        disk: Rc<RefCell<VirtualDisk>>,
        terminal: Rc<RefCell<dyn Terminal>>,
        current_drive: Rc<Cell<u8>>,
        current_user: Rc<Cell<u8>>,
    ) -> Self {
        Bdos {
            disk,
            terminal,
            dma_addr: 0x0080,
            current_drive,
            current_user,
            open_files: HashMap::new(),
            search: SearchState::default(),
        }
    }

    pub fn dispatch(&mut self, cpu: &mut Cpu) {
        let function = cpu.reg.c;
        match function {
            0 => cpu.halted = true, // P_TERMCPM: warm boot equivalent
            1 => self.f1_console_read(cpu),
            2 => self.f2_console_write(cpu),
            6 => self.f6_direct_io(cpu),
            9 => self.f9_print_string(cpu),
            10 => self.f10_read_line(cpu),
            11 => {
                cpu.reg.a = if self.terminal.borrow_mut().has_input() { 0xFF } else { 0x00 };
            }
            12 => {
                cpu.reg.a = 0x22;
                cpu.reg.h = 0;
                cpu.reg.l = 0x22;
            }
            13 => {} // RESET_DISK: nothing to reset in a single-drive virtual disk
            14 => self.current_drive.set(cpu.reg.e),
            15 => self.f15_open_file(cpu),
            16 => self.f16_close_file(cpu),
            17 => self.f17_search_first(cpu),
            18 => self.f18_search_next(cpu),
            19 => self.f19_delete_file(cpu),
            20 => self.f20_read_sequential(cpu),
            21 => self.f21_write_sequential(cpu),
            22 => self.f22_make_file(cpu),
            23 => self.f23_rename_file(cpu),
            24 => {
                cpu.reg.h = 0;
                cpu.reg.l = 0x01; // drive A only present
            }
            25 => cpu.reg.a = self.current_drive.get(),
            26 => self.dma_addr = cpu.reg.de(),
            32 => self.f32_get_set_user(cpu),
            33 => self.f33_random_read(cpu),
            34 => self.f34_random_write(cpu),
            35 => self.f35_compute_file_size(cpu),
            _ => cpu.reg.a = 0xFF,
        }
    }

    fn f1_console_read(&mut self, cpu: &mut Cpu) {
        cpu.reg.a = self.terminal.borrow_mut().read_char();
    }

    fn f2_console_write(&mut self, cpu: &mut Cpu) {
        self.terminal.borrow_mut().write_char(cpu.reg.e);
    }

    fn f6_direct_io(&mut self, cpu: &mut Cpu) {
        if cpu.reg.e == 0xFF {
            let mut term = self.terminal.borrow_mut();
            cpu.reg.a = if term.has_input() { term.read_char() } else { 0 };
        } else {
            self.terminal.borrow_mut().write_char(cpu.reg.e);
        }
    }

    fn f9_print_string(&mut self, cpu: &mut Cpu) {
        let mut addr = cpu.reg.de();
        let mut term = self.terminal.borrow_mut();
        loop {
            let byte = cpu.mem.read(addr);
            if byte == b'$' {
                break;
            }
            term.write_char(byte);
            addr = addr.wrapping_add(1);
        }
    }

    fn f10_read_line(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let max_len = cpu.mem.read(de) as usize;
        let mut term = self.terminal.borrow_mut();
        let mut count = 0usize;
        loop {
            if count >= max_len {
                break;
            }
            let byte = term.read_char();
            if byte == b'\r' || byte == b'\n' {
                break;
            }
            cpu.mem.write(de + 2 + count as u16, byte);
            count += 1;
        }
        cpu.mem.write(de + 1, count as u8);
    }

    fn f15_open_file(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let fcb = Fcb::new(de);
        let filename = fcb.filename(&cpu.mem);
        if self.disk.borrow().exists(&filename) {
            fcb.set_current_record(&mut cpu.mem, 0);
            self.open_files.insert(de, OpenFile { filename, offset: 0 });
            cpu.reg.a = 0;
        } else {
            cpu.reg.a = 0xFF;
        }
    }

    fn f16_close_file(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        cpu.reg.a = if self.open_files.remove(&de).is_some() { 0 } else { 0xFF };
    }

    fn f17_search_first(&mut self, cpu: &mut Cpu) {
        let fcb = Fcb::new(cpu.reg.de());
        let pattern = fcb.filename(&cpu.mem);
        let matches = self.disk.borrow().list(&pattern);
        self.search = SearchState { pattern, remaining: matches };
        self.pop_search_result(cpu);
    }

    fn f18_search_next(&mut self, cpu: &mut Cpu) {
        self.pop_search_result(cpu);
    }

    fn pop_search_result(&mut self, cpu: &mut Cpu) {
        if self.search.remaining.is_empty() {
            cpu.reg.a = 0xFF;
            return;
        }
        let name = self.search.remaining.remove(0);
        self.write_directory_entry(cpu, &name);
        cpu.reg.a = 0;
    }

    /// Writes a 32-byte directory-entry-shaped record into the DMA buffer:
    /// drive byte, padded 8-char name, padded 3-char extension, the rest
    /// zero.
    fn write_directory_entry(&self, cpu: &mut Cpu, name: &str) {
        let base = self.dma_addr;
        for i in 0..32u16 {
            cpu.mem.write(base + i, 0);
        }
        let (stem, ext) = match name.split_once('.') {
            Some((n, e)) => (n, e),
            None => (name, ""),
        };
        for (i, b) in stem.bytes().take(8).enumerate() {
            cpu.mem.write(base + 1 + i as u16, b);
        }
        for i in stem.len()..8 {
            cpu.mem.write(base + 1 + i as u16, b' ');
        }
        for (i, b) in ext.bytes().take(3).enumerate() {
            cpu.mem.write(base + 9 + i as u16, b);
        }
        for i in ext.len()..3 {
            cpu.mem.write(base + 9 + i as u16, b' ');
        }
    }

    fn f19_delete_file(&mut self, cpu: &mut Cpu) {
        let fcb = Fcb::new(cpu.reg.de());
        let pattern = fcb.filename(&cpu.mem);
        let matches = self.disk.borrow().list(&pattern);
        let mut disk = self.disk.borrow_mut();
        let mut any = false;
        for name in matches {
            if disk.delete(&name).is_ok() {
                any = true;
            }
        }
        cpu.reg.a = if any { 0 } else { 0xFF };
    }

    fn f20_read_sequential(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let filename = match self.open_files.get(&de) {
            Some(f) => f.filename.clone(),
            None => {
                cpu.reg.a = 9;
                return;
            }
        };
        let disk = self.disk.borrow();
        let data = match disk.read(&filename) {
            Some(d) => d,
            None => {
                cpu.reg.a = 9;
                return;
            }
        };
        let offset = self.open_files.get(&de).unwrap().offset;
        if offset >= data.len() {
            cpu.reg.a = 1;
            return;
        }
        let end = (offset + RECORD_SIZE as usize).min(data.len());
        let chunk = &data[offset..end];
        let dma = self.dma_addr;
        for (i, &b) in chunk.iter().enumerate() {
            cpu.mem.write(dma + i as u16, b);
        }
        for i in chunk.len()..RECORD_SIZE as usize {
            cpu.mem.write(dma + i as u16, crate::disk::EOF_MARKER);
        }
        drop(disk);
        self.open_files.get_mut(&de).unwrap().offset += RECORD_SIZE as usize;
        cpu.reg.a = 0;
    }

    fn f21_write_sequential(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let filename = match self.open_files.get(&de) {
            Some(f) => f.filename.clone(),
            None => {
                cpu.reg.a = 9;
                return;
            }
        };
        let offset = self.open_files.get(&de).unwrap().offset;
        let dma = self.dma_addr;
        let chunk = cpu.mem.slice(dma, RECORD_SIZE as usize);
        let mut disk = self.disk.borrow_mut();
        let mut data = disk.read(&filename).map(|d| d.to_vec()).unwrap_or_default();
        if data.len() < offset + RECORD_SIZE as usize {
            data.resize(offset + RECORD_SIZE as usize, 0);
        }
        data[offset..offset + RECORD_SIZE as usize].copy_from_slice(&chunk);
        disk.write(&filename, data);
        drop(disk);
        self.open_files.get_mut(&de).unwrap().offset += RECORD_SIZE as usize;
        cpu.reg.a = 0;
    }

    fn f22_make_file(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let fcb = Fcb::new(de);
        let filename = fcb.filename(&cpu.mem);
        self.disk.borrow_mut().write(&filename, Vec::new());
        fcb.set_current_record(&mut cpu.mem, 0);
        self.open_files.insert(de, OpenFile { filename, offset: 0 });
        cpu.reg.a = 0;
    }

    fn f23_rename_file(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let old_fcb = Fcb::new(de);
        let new_fcb = Fcb::new(de + 16);
        let old_name = old_fcb.filename(&cpu.mem);
        let new_name = new_fcb.filename(&cpu.mem);
        cpu.reg.a = if self.disk.borrow_mut().rename(&old_name, &new_name).is_ok() {
            0
        } else {
            0xFF
        };
    }

    fn f32_get_set_user(&mut self, cpu: &mut Cpu) {
        if cpu.reg.e == 0xFF {
            cpu.reg.a = self.current_user.get();
        } else {
            self.current_user.set(cpu.reg.e);
        }
    }

    fn f33_random_read(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let fcb = Fcb::new(de);
        let record = fcb.random_record_for_seek(&cpu.mem) as usize;
        let offset = record * RECORD_SIZE as usize;
        let filename = fcb.filename(&cpu.mem);
        let disk = self.disk.borrow();
        let data = match disk.read(&filename) {
            Some(d) => d,
            None => {
                cpu.reg.a = 9;
                return;
            }
        };
        if offset >= data.len() {
            cpu.reg.a = 6;
            return;
        }
        let end = (offset + RECORD_SIZE as usize).min(data.len());
        let chunk = &data[offset..end];
        let dma = self.dma_addr;
        for (i, &b) in chunk.iter().enumerate() {
            cpu.mem.write(dma + i as u16, b);
        }
        for i in chunk.len()..RECORD_SIZE as usize {
            cpu.mem.write(dma + i as u16, crate::disk::EOF_MARKER);
        }
        cpu.reg.a = 0;
    }

    fn f34_random_write(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let fcb = Fcb::new(de);
        let record = fcb.random_record_for_seek(&cpu.mem) as usize;
        let offset = record * RECORD_SIZE as usize;
        let filename = fcb.filename(&cpu.mem);
        let dma = self.dma_addr;
        let chunk = cpu.mem.slice(dma, RECORD_SIZE as usize);
        let mut disk = self.disk.borrow_mut();
        let mut data = disk.read(&filename).map(|d| d.to_vec()).unwrap_or_default();
        if data.len() < offset + RECORD_SIZE as usize {
            data.resize(offset + RECORD_SIZE as usize, 0);
        }
        data[offset..offset + RECORD_SIZE as usize].copy_from_slice(&chunk);
        disk.write(&filename, data);
        cpu.reg.a = 0;
    }

    fn f35_compute_file_size(&mut self, cpu: &mut Cpu) {
        let de = cpu.reg.de();
        let fcb = Fcb::new(de);
        let filename = fcb.filename(&cpu.mem);
        let len = self.disk.borrow().len(&filename).unwrap_or(0);
        let records = (len + RECORD_SIZE as usize - 1) / RECORD_SIZE as usize;
        fcb.set_random_record(&mut cpu.mem, records as u32);
        cpu.reg.a = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::BufferedTerminal;

    fn setup() -> (Bdos, Cpu<'static>) {
        let disk = Rc::new(RefCell::new(VirtualDisk::new()));
        let terminal: Rc<RefCell<dyn Terminal>> = Rc::new(RefCell::new(BufferedTerminal::new()));
        let drive = Rc::new(Cell::new(0u8));
        let user = Rc::new(Cell::new(0u8));
        (Bdos::new(disk, terminal, drive, user), Cpu::new())
    }

    #[test]
    fn function_9_prints_until_dollar_sign() {
        let (mut bdos, mut cpu) = setup();
        cpu.mem.load(0x0200, b"Hi!$");
        cpu.reg.c = 9;
        cpu.reg.set_de(0x0200);
        bdos.dispatch(&mut cpu);
        assert_eq!(bdos.terminal.borrow_mut().has_input(), false);
    }

    #[test]
    fn function_35_computes_rounded_up_record_count() {
        let (mut bdos, mut cpu) = setup();
        bdos.disk.borrow_mut().write("BIG.DAT", vec![0u8; 300]);
        let fcb = Fcb::new(0x005C);
        fcb.set_filename(&mut cpu.mem, "BIG.DAT");
        cpu.reg.c = 35;
        cpu.reg.set_de(0x005C);
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0);
        assert_eq!(cpu.mem.read(0x005C + crate::fcb::OFF_RANDOM_RECORD), 3);
        assert_eq!(cpu.mem.read(0x005C + crate::fcb::OFF_RANDOM_RECORD + 1), 0);
    }

    #[test]
    fn function_17_search_first_returns_ff_when_no_match() {
        let (mut bdos, mut cpu) = setup();
        let fcb = Fcb::new(0x005C);
        fcb.set_filename(&mut cpu.mem, "*.*");
        cpu.reg.c = 17;
        cpu.reg.set_de(0x005C);
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0xFF);
    }

    #[test]
    fn function_18_after_exhaustion_also_returns_ff() {
        let (mut bdos, mut cpu) = setup();
        bdos.disk.borrow_mut().write("A.COM", vec![]);
        let fcb = Fcb::new(0x005C);
        fcb.set_filename(&mut cpu.mem, "*.*");
        cpu.reg.c = 17;
        cpu.reg.set_de(0x005C);
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0);
        cpu.reg.c = 18;
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0xFF);
    }

    #[test]
    fn function_20_read_at_eof_returns_1_without_prior_data_loss() {
        let (mut bdos, mut cpu) = setup();
        bdos.disk.borrow_mut().write("EMPTY.DAT", vec![]);
        let fcb = Fcb::new(0x005C);
        fcb.set_filename(&mut cpu.mem, "EMPTY.DAT");
        cpu.reg.c = 15; // open
        cpu.reg.set_de(0x005C);
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0);
        cpu.reg.c = 20; // read
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 1);
    }

    #[test]
    fn function_33_random_read_past_eof_returns_6() {
        let (mut bdos, mut cpu) = setup();
        bdos.disk.borrow_mut().write("SMALL.DAT", vec![1u8; 10]);
        let fcb = Fcb::new(0x005C);
        fcb.set_filename(&mut cpu.mem, "SMALL.DAT");
        fcb.set_random_record(&mut cpu.mem, 5);
        cpu.reg.c = 33;
        cpu.reg.set_de(0x005C);
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 6);
    }

    #[test]
    fn function_12_reports_version_0x22() {
        let (mut bdos, mut cpu) = setup();
        cpu.reg.c = 12;
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0x22);
        assert_eq!(cpu.reg.l, 0x22);
        assert_eq!(cpu.reg.h, 0);
    }

    #[test]
    fn unimplemented_function_returns_0xff() {
        let (mut bdos, mut cpu) = setup();
        cpu.reg.c = 200;
        bdos.dispatch(&mut cpu);
        assert_eq!(cpu.reg.a, 0xFF);
    }
}
