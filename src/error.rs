//! Typed error kinds for nozem.
//!
//! Library code mostly returns `anyhow::Result` with `.context(...)` chains
//! (matching the rest of the crate), but the top-level CLI handler needs to
//! know which of the four kinds in the design occurred so it can decide
//! between a single-line "simple" message and a fuller diagnostic. `NozemError`
//! is that discriminant; it is constructed at the boundary where a failure
//! is first classified, then wrapped into `anyhow::Error` for propagation.

use std::fmt;

use thiserror::Error;

/// One of the four error kinds a nozem run can end in.
#[derive(Debug, Error)]
pub enum NozemError {
    /// Missing `nozem.json`, unknown unit identifier, workspace root not
    /// found. Printed as a single line, no stack trace.
    #[error("{0}")]
    Configuration(String),

    /// The user's build or test command exited non-zero. Full command, cwd,
    /// env, exit code and stdout/stderr tail have already been printed to
    /// stderr by the sandbox; this carries only the one-line summary.
    #[error("{0}")]
    Build(String),

    /// An I/O or network error during cache read/write. Never returned to
    /// a caller that would abort a build — always caught and logged at the
    /// point of use, tripping the relevant circuit breaker.
    #[error("{0}")]
    Cache(String),

    /// Empty graph, cycle, or dependency-not-found. Fatal.
    #[error("{0}")]
    Graph(String),
}

impl NozemError {
    pub fn is_simple(&self) -> bool {
        matches!(self, NozemError::Configuration(_) | NozemError::Graph(_))
    }
}

/// Captured detail of a failed sandboxed command, per the build-sandbox
/// contract in §4.5: command, cwd, full env, exit code, stdout, stderr.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub command: String,
    pub cwd: String,
    pub env: Vec<(String, String)>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailure {
    /// Writes the full detail to stderr (colored), and returns the
    /// concise single-line summary that propagates as the actual error.
    pub fn log_and_summarize(&self) -> String {
        use colored::Colorize;
        eprintln!("{}", "build command failed".red().bold());
        eprintln!("  {} {}", "command:".dimmed(), self.command);
        eprintln!("  {} {}", "cwd:".dimmed(), self.cwd);
        eprintln!(
            "  {} {}",
            "exit code:".dimmed(),
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        );
        if !self.env.is_empty() {
            eprintln!("  {}", "env:".dimmed());
            for (k, v) in &self.env {
                eprintln!("    {}={}", k, v);
            }
        }
        if !self.stdout.is_empty() {
            eprintln!("  {}", "stdout:".dimmed());
            eprintln!("{}", self.stdout);
        }
        if !self.stderr.is_empty() {
            eprintln!("  {}", "stderr:".dimmed());
            eprintln!("{}", self.stderr);
        }
        self.summary()
    }

    pub fn summary(&self) -> String {
        format!(
            "command `{}` failed in {} ({})",
            self.command,
            self.cwd,
            self.exit_code
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "terminated by signal".to_string())
        )
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
