//! CLI - Command Line Interface for memstream
//!
//! Every operation is scriptable; with `--json` (or when stdout is not a
//! terminal) all output is JSON-parseable and logs stay on stderr.
//!
//! # Examples
//!
//! ```bash
//! # List the files of a transfer
//! memstream files ~/Videos/show/*.mkv
//!
//! # Serve them over HTTP until Ctrl-C
//! memstream serve ~/Videos/show/*.mkv
//!
//! # Play the second episode and queue the rest
//! memstream play ~/Videos/show/*.mkv --index 1 --all
//! ```

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

use crate::models::{FileEntry, PlaybackStatus};

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments
    InvalidArgs = 2,
    /// No playable media
    NoMedia = 3,
    /// Player binary not found
    PlayerNotFound = 4,
    /// Player failed to start or connect
    LaunchFailed = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> std::process::ExitCode {
        std::process::ExitCode::from(code as u8)
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// memstream - stream pieced transfers to mpv straight from memory
#[derive(Parser, Debug)]
#[command(
    name = "memstream",
    version,
    about = "Stream pieced transfers to mpv straight from memory",
    long_about = "Serves the files of a transfer over a loopback HTTP bridge backed \
                  by an in-memory piece cache, and drives mpv through its playlist \
                  while releasing what has been watched.",
    after_help = "EXAMPLES:\n\
                  memstream files show/*.mkv               List files and piece ranges\n\
                  memstream serve show/*.mkv               Serve files until Ctrl-C\n\
                  memstream play show/*.mkv -i 1 --all     Play from episode 2 on\n\
                  memstream config --mpv-path /opt/mpv     Remember the mpv binary"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the files of a transfer with their piece ranges
    #[command(visible_alias = "ls")]
    Files(FilesCmd),

    /// Serve the media files over HTTP until interrupted
    Serve(ServeCmd),

    /// Play media files in mpv
    #[command(visible_alias = "p")]
    Play(PlayCmd),

    /// Show or change the configuration
    Config(ConfigCmd),
}

/// Source files making up one transfer
#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Files to stream, in transfer order
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Piece size in bytes (default from config)
    #[arg(long)]
    pub piece_length: Option<u64>,
}

/// List files and piece ranges
#[derive(Args, Debug)]
pub struct FilesCmd {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Only list playable media files
    #[arg(long, short = 'm')]
    pub media: bool,
}

/// Serve media files over the HTTP bridge
#[derive(Args, Debug)]
pub struct ServeCmd {
    #[command(flatten)]
    pub source: SourceArgs,
}

/// Play media files in mpv
#[derive(Args, Debug)]
pub struct PlayCmd {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Media file to start with (position in the sorted media listing)
    #[arg(long, short = 'i', default_value = "0")]
    pub index: usize,

    /// Queue every media file, starting at --index
    #[arg(long, short = 'a')]
    pub all: bool,

    /// mpv binary to use
    #[arg(long)]
    pub mpv: Option<PathBuf>,
}

impl PlayCmd {
    /// `--all` or the config's `stream_all`
    pub fn stream_all(&self, config_default: bool) -> bool {
        self.all || config_default
    }
}

/// Show or update the configuration
#[derive(Args, Debug)]
pub struct ConfigCmd {
    /// Remember this mpv binary
    #[arg(long, conflicts_with = "clear_mpv_path")]
    pub mpv_path: Option<PathBuf>,

    /// Forget the remembered mpv binary
    #[arg(long)]
    pub clear_mpv_path: bool,
}

impl ConfigCmd {
    pub fn is_update(&self) -> bool {
        self.mpv_path.is_some() || self.clear_mpv_path
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            exit_code: code.into(),
        }
    }
}

/// File listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct FilesResponse {
    pub transfer: String,
    pub name: String,
    pub piece_length: u64,
    pub pieces: usize,
    pub files: Vec<FileEntry>,
}

/// One served file
#[derive(Debug, Serialize, Deserialize)]
pub struct ServedFile {
    pub index: usize,
    pub name: String,
    pub length: u64,
    pub url: String,
}

/// Serve response
#[derive(Debug, Serialize, Deserialize)]
pub struct ServeResponse {
    pub address: String,
    pub files: Vec<ServedFile>,
}

/// Playback finished response
#[derive(Debug, Serialize)]
pub struct PlayResponse {
    pub status: &'static str,
    pub exit: String,
    pub clean: bool,
    pub last: PlaybackStatus,
}

/// Config response
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub config: crate::config::Config,
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            // For non-JSON, caller should handle formatting
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    }

    /// Print one compact JSON line (status streams)
    pub fn print_line<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(data)?);
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let output = JsonOutput::<()>::error_msg(&msg, code);
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
        }
        code
    }

    /// Print info message (suppressed in quiet mode)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
