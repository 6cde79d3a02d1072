//! External tool invocation.
//!
//! The external executables (hive parser, log fetcher, reputation lookup)
//! are opaque: given arguments, they populate or update a local working
//! database as a side effect. The bridge launches one, blocks until it
//! exits, and discards its exit code; failures surface only indirectly,
//! as an absent or unreadable database afterward. Exactly one invocation is
//! in flight at a time.
//!
//! [`ToolRunner`] is an injectable capability so tests can substitute a
//! fake that fabricates the working database without launching anything.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// One invocation of the external tool, in its fixed argument grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    /// Parse an input file into a working database:
    /// `<exe> -r <input> -d <output_db>`.
    Extract {
        input: PathBuf,
        output_db: PathBuf,
    },
    /// Fetch CloudTrail logs into a working database:
    /// `<exe> -a <access_key> -s <secret_key> -r <region> -b <bucket> -d <output_db>`.
    FetchLogs {
        access_key: String,
        secret_key: String,
        region: String,
        bucket: String,
        output_db: PathBuf,
    },
    /// Look up one row's hash and write the verdict back into the working
    /// database: `<exe> -d <db> -a <api_key> -t <table> -k <row_key>`.
    /// `key` is the 1-based positional primary key.
    Lookup {
        db: PathBuf,
        api_key: String,
        table: String,
        key: i64,
    },
}

impl ToolInvocation {
    /// The argument vector for this invocation.
    pub fn args(&self) -> Vec<OsString> {
        match self {
            ToolInvocation::Extract { input, output_db } => vec![
                "-r".into(),
                input.clone().into(),
                "-d".into(),
                output_db.clone().into(),
            ],
            ToolInvocation::FetchLogs {
                access_key,
                secret_key,
                region,
                bucket,
                output_db,
            } => vec![
                "-a".into(),
                access_key.into(),
                "-s".into(),
                secret_key.into(),
                "-r".into(),
                region.into(),
                "-b".into(),
                bucket.into(),
                "-d".into(),
                output_db.clone().into(),
            ],
            ToolInvocation::Lookup {
                db,
                api_key,
                table,
                key,
            } => vec![
                "-d".into(),
                db.clone().into(),
                "-a".into(),
                api_key.into(),
                "-t".into(),
                table.into(),
                "-k".into(),
                key.to_string().into(),
            ],
        }
    }
}

/// Runs external tool invocations to completion.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Launch the tool and wait for it to exit. Only a launch failure is an
    /// error; a nonzero exit is not (the tool's side effects are checked by
    /// opening the database it was supposed to produce).
    async fn run(&self, invocation: &ToolInvocation) -> Result<()>;
}

/// Executable-backed runner.
pub struct ExeRunner {
    exe: PathBuf,
}

impl ExeRunner {
    /// Wrap an executable path. A missing executable is a configuration
    /// error: the run must not start.
    pub fn new(exe: &Path) -> Result<Self> {
        if !exe.exists() {
            anyhow::bail!("external tool not found: {}", exe.display());
        }
        Ok(Self {
            exe: exe.to_path_buf(),
        })
    }
}

#[async_trait]
impl ToolRunner for ExeRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        let status = Command::new(&self.exe)
            .args(invocation.args())
            .status()
            .await
            .with_context(|| format!("Failed to launch {}", self.exe.display()))?;

        // Exit code intentionally discarded; an unusable database is
        // detected when the next unit of work tries to open it.
        let _ = status;
        Ok(())
    }
}
