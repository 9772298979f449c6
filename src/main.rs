// Interactive front-end: parses CLI config, wires up logging, opens a
// raw-mode terminal, and either drops into the CCP prompt or runs a
// single named `.COM` program directly.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use cpm_core::config::Cli;
use cpm_core::machine::Machine;
use cpm_core::terminal::{RawTerminal8080, Terminal};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.trace { "cpm_core=trace" } else { "cpm_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new(filter),
        ))
        .with_writer(std::io::stderr)
        .init();

    let terminal = RawTerminal8080::new()?;
    let terminal: Rc<RefCell<dyn Terminal>> = Rc::new(RefCell::new(terminal));
    let mut machine = Machine::new(terminal);

    if let Some(dir) = &cli.disk_dir {
        preload_disk(&mut machine, dir)?;
    }

    match &cli.program {
        Some(program) => {
            let name = cpm_core::ccp::normalize_program_name(program);
            let bytes = machine
                .disk()
                .borrow()
                .read(&name)
                .map(|b| b.to_vec())
                .ok_or_else(|| cpm_core::CrateError::ProgramNotFound(name.clone()))?;
            let args = cli.args.join(" ");
            machine.run_com_file(&bytes, &name, &args)?;
        }
        None => machine.start(),
    }

    Ok(())
}

/// Loads every regular file in `dir` onto the virtual disk under its
/// upper-cased 8.3 name, read-only seeding for a fresh session. Text-typed
/// files are normalized through CR/LF + EOF-marker framing on the way in,
/// so `TYPE` sees the same canonical form regardless of the host's own line
/// endings; everything else (notably `.COM`) is loaded byte-for-byte.
fn preload_disk(machine: &mut Machine<'static>, dir: &std::path::Path) -> anyhow::Result<()> {
    let disk = machine.disk();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_uppercase();
        let data = std::fs::read(entry.path())?;
        if is_text_extension(&name) {
            let text = String::from_utf8_lossy(&data);
            let lines: Vec<&str> = text.lines().collect();
            disk.borrow_mut().write_text(&name, &lines);
        } else {
            disk.borrow_mut().write(&name, data);
        }
        tracing::info!(file = %name, "preloaded onto virtual disk");
    }
    Ok(())
}

fn is_text_extension(name: &str) -> bool {
    matches!(name.rsplit('.').next(), Some("TXT") | Some("ASM") | Some("DOC") | Some("PRN"))
}
