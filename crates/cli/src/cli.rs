use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};

/// Vmtrace: live virtual-memory tracing for Linux process trees
///
/// Vmtrace consumes decoded kernel memory-management events (mmap, munmap,
/// mremap, brk, clone) for a traced command and its descendants, maintains a
/// coalesced model of each process's virtual address space, and broadcasts
/// incremental state deltas to subscribers.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub(crate) struct Cli {
    /// Command to launch and trace, with its arguments.
    #[arg(trailing_var_arg = true, conflicts_with = "all")]
    pub(crate) command: Vec<String>,

    /// Trace all processes instead of launching a command.
    #[arg(short, long)]
    pub(crate) all: bool,

    /// Path to configuration file.
    ///
    /// Empty string means no conf file.
    #[arg(short, long, value_parser = validate_file)]
    pub(crate) conffile: Option<PathBuf>,

    /// Unix socket the probe collaborator streams raw records on.
    ///
    /// Overrides the configured path.
    #[arg(short, long)]
    pub(crate) socket: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    pub(crate) print_config: bool,

    #[command(flatten)]
    pub(crate) verbosity: Verbosity<WarnLevel>,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_all_are_exclusive() {
        assert!(Cli::try_parse_from(["vmtrace", "--all", "sleep", "1"]).is_err());
        assert!(Cli::try_parse_from(["vmtrace", "--all"]).is_ok());
        let cli = Cli::try_parse_from(["vmtrace", "sleep", "1"]).unwrap();
        assert_eq!(cli.command, vec!["sleep", "1"]);
    }

    #[test]
    fn conffile_must_exist() {
        assert!(Cli::try_parse_from(["vmtrace", "-c", "/nope.toml", "--all"]).is_err());
        let file = tempfile::NamedTempFile::new().unwrap();
        let cli = Cli::try_parse_from([
            "vmtrace",
            "-c",
            file.path().to_str().unwrap(),
            "--all",
        ])
        .unwrap();
        assert_eq!(cli.conffile.as_deref(), Some(file.path()));
    }
}
