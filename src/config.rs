// Command-line configuration for the interactive binary. Kept separate
// from `main.rs` so the parsed shape is unit-testable without touching a
// real terminal.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cpm", about = "An Intel 8080 / CP/M 2.2 personal computer emulator")]
pub struct Cli {
    /// Transient program to launch at startup (a `.COM` file name on the
    /// virtual disk), CCP's prompt runs standalone if omitted.
    pub program: Option<String>,

    /// Arguments passed to `program` as its command tail.
    pub args: Vec<String>,

    /// Directory of host files to preload onto the virtual disk.
    #[arg(long)]
    pub disk_dir: Option<PathBuf>,

    /// Enables per-instruction CPU tracing (very verbose).
    #[arg(long)]
    pub trace: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_program_with_trailing_args() {
        let cli = Cli::parse_from(["cpm", "HELLO.COM", "arg1", "arg2"]);
        assert_eq!(cli.program.as_deref(), Some("HELLO.COM"));
        assert_eq!(cli.args, vec!["arg1".to_string(), "arg2".to_string()]);
        assert!(!cli.trace);
    }

    #[test]
    fn parses_with_no_program_for_bare_ccp_prompt() {
        let cli = Cli::parse_from(["cpm"]);
        assert!(cli.program.is_none());
        assert!(cli.args.is_empty());
    }

    #[test]
    fn trace_flag_and_disk_dir_are_recognized() {
        let cli = Cli::parse_from(["cpm", "--trace", "--disk-dir", "/tmp/disk"]);
        assert!(cli.trace);
        assert_eq!(cli.disk_dir, Some(PathBuf::from("/tmp/disk")));
    }
}
