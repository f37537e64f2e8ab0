//! Scriptable [`ProcessRunner`] for tests.
//!
//! Built for this crate's unit tests and, with the `mock` feature, for
//! integration tests.
//!
//! With a mount table attached, `mount` and `umount` edit that file the way
//! the kernel would, so [`FsOps::is_mounted`](super::FsOps::is_mounted) and
//! boot-time cleanup see consistent state without root privileges.

use std::{
    collections::HashMap,
    ffi::OsString,
    path::PathBuf,
    sync::Mutex,
};

use async_trait::async_trait;

use super::runner::{ProcessOutput, ProcessRunner};
use crate::error::FsError;

type Handler = Box<dyn Fn(&[OsString]) -> Result<ProcessOutput, FsError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Default)]
pub struct MockRunner {
    mount_table: Option<PathBuf>,
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRunner {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track mounts in a fake mount table file.
    pub fn with_mount_table(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !path.exists() {
            if let Err(e) = std::fs::write(&path, "") {
                warn!("cannot create mount table {}: {e}", path.display());
            }
        }
        Self {
            mount_table: Some(path),
            ..Default::default()
        }
    }

    pub fn on<F>(&self, program: &str, handler: F) -> &Self
    where
        F: Fn(&[OsString]) -> Result<ProcessOutput, FsError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(program.to_string(), Box::new(handler));
        self
    }

    /// Make `program` exit with `code`.
    pub fn fail(&self, program: &str, code: i32, stderr: &'static str) -> &Self {
        self.on(program, move |_| Ok(ProcessOutput::failure(code, stderr)))
    }

    /// Make `wget -q -O <dest> <url>` write `contents` to `dest`.
    pub fn wget_writes(&self, contents: &'static [u8]) -> &Self {
        self.on("wget", move |args| {
            let dest = args
                .get(2)
                .map(PathBuf::from)
                .ok_or_else(|| FsError::Spawn {
                    command: "wget".into(),
                    source: std::io::Error::other("missing -O destination"),
                })?;
            std::fs::write(&dest, contents).map_err(|e| FsError::io(&dest, e))?;
            Ok(ProcessOutput::success())
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .map(|c| c.args)
            .collect()
    }

    fn table_op(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, FsError> {
        let Some(table) = &self.mount_table else {
            return Ok(ProcessOutput::success());
        };
        let content = std::fs::read_to_string(table).map_err(|e| FsError::io(table, e))?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        match program {
            "mount" => {
                let iso = args.len().checked_sub(2).and_then(|i| args.get(i));
                let (Some(iso), Some(dir)) = (iso, args.last()) else {
                    return Ok(ProcessOutput::failure(1, "mount: bad usage"));
                };
                let dir = dir.to_string_lossy().replace(' ', "\\040");
                if lines.iter().any(|l| l.split_whitespace().nth(1) == Some(dir.as_str())) {
                    return Ok(ProcessOutput::failure(32, "mount: already mounted"));
                }
                lines.push(format!(
                    "{} {} iso9660 ro 0 0",
                    iso.to_string_lossy().replace(' ', "\\040"),
                    dir
                ));
            }
            "umount" => {
                let Some(dir) = args.last() else {
                    return Ok(ProcessOutput::failure(1, "umount: bad usage"));
                };
                let dir = dir.to_string_lossy().replace(' ', "\\040");
                let before = lines.len();
                lines.retain(|l| l.split_whitespace().nth(1) != Some(dir.as_str()));
                if lines.len() == before {
                    return Ok(ProcessOutput::failure(32, "umount: not mounted"));
                }
            }
            _ => return Ok(ProcessOutput::success()),
        }

        let mut out = lines.join("\n");
        out.push('\n');
        std::fs::write(table, out).map_err(|e| FsError::io(table, e))?;
        Ok(ProcessOutput::success())
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, FsError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedCall {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            });

        {
            let handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handler) = handlers.get(program) {
                return handler(args);
            }
        }
        self.table_op(program, args)
    }
}
