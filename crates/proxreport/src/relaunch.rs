//! Post-update relaunch
//!
//! After a successful update the process replaces itself with the freshly
//! installed program, passing `--skip-update` so the new image cannot
//! update (and relaunch) again.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use tracing::info;

pub const SKIP_UPDATE_FLAG: &str = "--skip-update";
pub const UPDATE_FLAG: &str = "--update";

/// Replaces the running program; returns only when that failed
pub trait Relauncher: Send + Sync {
    fn relaunch(&self) -> io::Error;
}

/// Argument list for the relaunched process
pub fn relaunch_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out: Vec<OsString> = args
        .into_iter()
        .filter(|a| a.as_os_str() != OsStr::new(UPDATE_FLAG) && a.as_os_str() != OsStr::new(SKIP_UPDATE_FLAG))
        .collect();
    out.push(OsString::from(SKIP_UPDATE_FLAG));
    out
}

/// `execv` of the current executable with the original arguments
#[derive(Debug, Clone)]
pub struct ExecRelauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecRelauncher {
    /// Capture the current executable and its arguments (minus argv[0])
    pub fn from_current_process() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: relaunch_args(std::env::args_os().skip(1)),
        })
    }
}

impl Relauncher for ExecRelauncher {
    fn relaunch(&self) -> io::Error {
        info!("Relaunching {} with {}", self.program.display(), SKIP_UPDATE_FLAG);
        Command::new(&self.program).args(&self.args).exec()
    }
}
