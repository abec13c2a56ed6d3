//! External helper programs.
//!
//! Some transitions run a user supplied program, e.g. to fence the peer
//! ("outdate-peer") or to report a split brain. The program gets the
//! helper name as its only argument and the device minor in the
//! environment; its exit code is the answer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{ReplError, ReplResult};

/// Runs external helpers.
pub trait Helper: Send + Sync + std::fmt::Debug {
    /// Run helper `name` for device `minor` and return its exit code.
    fn call(&self, name: &str, minor: u32) -> ReplResult<i32>;
}

/// Runs a configured program.
#[derive(Debug, Clone)]
pub struct CommandHelper {
    program: PathBuf,
}

impl CommandHelper {
    /// Use `program` for every helper.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Helper for CommandHelper {
    fn call(&self, name: &str, minor: u32) -> ReplResult<i32> {
        info!(minor, "helper command: {} {name}", self.program.display());
        let status = Command::new(&self.program)
            .arg(name)
            .env("BLKREPL_MINOR", minor.to_string())
            .status()
            .map_err(|e| ReplError::Helper {
                name: name.to_string(),
                msg: e.to_string(),
            })?;
        let code = status.code().unwrap_or(-1);
        info!(minor, code, "helper command: {} {name} exit code {code}", self.program.display());
        Ok(code)
    }
}

/// Used when no helper program is configured; every helper "succeeds".
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHelper;

impl Helper for NoopHelper {
    fn call(&self, name: &str, minor: u32) -> ReplResult<i32> {
        warn!(minor, helper = name, "no helper program configured");
        Ok(0)
    }
}

/// Records calls and answers with preset exit codes.
#[derive(Debug, Default)]
pub struct ScriptedHelper {
    codes: Mutex<HashMap<String, i32>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHelper {
    /// A helper answering 0 to everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `code` when `name` is called.
    pub fn with_code(self, name: &str, code: i32) -> Self {
        self.codes.lock().insert(name.to_string(), code);
        self
    }

    /// Names of the helpers called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Helper for ScriptedHelper {
    fn call(&self, name: &str, _minor: u32) -> ReplResult<i32> {
        self.calls.lock().push(name.to_string());
        Ok(self.codes.lock().get(name).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_helper() {
        let h = ScriptedHelper::new().with_code("outdate-peer", 4);
        assert_eq!(h.call("outdate-peer", 0).unwrap(), 4);
        assert_eq!(h.call("split-brain", 0).unwrap(), 0);
        assert_eq!(h.calls(), vec!["outdate-peer", "split-brain"]);
    }

    #[test]
    fn test_noop_helper() {
        assert_eq!(NoopHelper.call("pri-lost", 3).unwrap(), 0);
    }

    #[test]
    fn test_missing_program() {
        let h = CommandHelper::new("/nonexistent/blkrepl-helper");
        assert!(matches!(h.call("split-brain", 0), Err(ReplError::Helper { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_passed_through() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n[ \"$1\" = outdate-peer ] && exit 5\nexit 0").unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let h = CommandHelper::new(&path);
        assert_eq!(h.call("outdate-peer", 1).unwrap(), 5);
        assert_eq!(h.call("split-brain", 1).unwrap(), 0);
    }
}
