use std::fmt::{self, Display};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, error};

/// Outcome of one external tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResult {
    /// `None` if the process could not be started or was killed by a signal.
    pub exit_code: Option<i32>,
    pub succeeded: bool,
}

impl StageResult {
    pub fn from_code(code: i32) -> StageResult {
        StageResult {
            exit_code: Some(code),
            succeeded: code == 0,
        }
    }

    pub fn not_started() -> StageResult {
        StageResult {
            exit_code: None,
            succeeded: false,
        }
    }
}

/// The tools the pipeline drives, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Organize,
    Aggregate,
    Convert,
}

impl Stage {
    /// Base name of the log file collecting the tool output.
    pub fn log_name(&self) -> &'static str {
        match self {
            Stage::Download => "db_download",
            Stage::Organize => "dataorganizer",
            Stage::Aggregate => "mainelab",
            Stage::Convert => "infoaria",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Download => "downloader",
            Stage::Organize => "organizer",
            Stage::Aggregate => "aggregator",
            Stage::Convert => "converter",
        };
        write!(f, "{}", s)
    }
}

/// Where a tool writes its stdout and stderr.
#[derive(Debug)]
pub enum OutputSink {
    /// Share the wrapper's own streams.
    Inherit,
    /// Append both streams to a log file.
    Log(StageLog),
}

/// A log file opened once per run and shared by every invocation of a stage.
#[derive(Debug)]
pub struct StageLog {
    path: PathBuf,
    file: File,
}

impl StageLog {
    /// Create (or truncate) the log file.  Later writes append.
    pub fn create(path: impl AsRef<Path>) -> io::Result<StageLog> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(StageLog { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        Ok((
            Stdio::from(self.file.try_clone()?),
            Stdio::from(self.file.try_clone()?),
        ))
    }
}

/// Runs one external executable to completion.
pub trait StageRunner {
    fn run(&mut self, executable: &str, args: &[String], sink: &OutputSink) -> StageResult;
}

/// Runs tools as child processes and waits for them, with no timeout.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl StageRunner for ProcessRunner {
    fn run(&mut self, executable: &str, args: &[String], sink: &OutputSink) -> StageResult {
        let mut cmd = Command::new(executable);
        cmd.args(args);
        if let OutputSink::Log(log) = sink {
            match log.stdio() {
                Ok((stdout, stderr)) => {
                    cmd.stdout(stdout).stderr(stderr);
                }
                Err(e) => {
                    error!("Cannot share log file {}: {}", log.path().display(), e);
                    return StageResult::not_started();
                }
            }
        }
        debug!("Running {} {}", executable, args.join(" "));
        match cmd.status() {
            Ok(status) => match status.code() {
                Some(code) => StageResult::from_code(code),
                None => {
                    error!("{} was terminated by a signal", executable);
                    StageResult::not_started()
                }
            },
            Err(e) => {
                error!("Failed to start {}: {}", executable, e);
                StageResult::not_started()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::error::Error;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write_script(path: &Path, body: &str) -> Result<(), Box<dyn Error>> {
        fs::write(path, format!("#!/bin/sh\n{}\n", body))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    #[test]
    fn exit_status_maps_to_result() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ok = dir.path().join("ok.sh");
        let ko = dir.path().join("ko.sh");
        write_script(&ok, "exit 0")?;
        write_script(&ko, "exit 3")?;

        let mut runner = ProcessRunner;
        let res = runner.run(ok.to_str().unwrap(), &[], &OutputSink::Inherit);
        assert_eq!(res, StageResult::from_code(0));
        assert!(res.succeeded);

        let res = runner.run(ko.to_str().unwrap(), &[], &OutputSink::Inherit);
        assert_eq!(res.exit_code, Some(3));
        assert!(!res.succeeded);
        Ok(())
    }

    #[test]
    fn missing_executable_is_not_started() {
        let mut runner = ProcessRunner;
        let res = runner.run("/nonexistent/tool", &[], &OutputSink::Inherit);
        assert_eq!(res, StageResult::not_started());
    }

    #[test]
    fn log_accumulates_across_invocations() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let tool = dir.path().join("echo.sh");
        write_script(&tool, "echo \"out $1\"\necho \"err $1\" >&2")?;
        let log_path = dir.path().join("tool.log");
        fs::write(&log_path, "stale content from a previous run\n")?;

        let sink = OutputSink::Log(StageLog::create(&log_path)?);
        let mut runner = ProcessRunner;
        for prov in ["RM", "LT"] {
            let res = runner.run(tool.to_str().unwrap(), &[prov.to_string()], &sink);
            assert!(res.succeeded);
        }
        drop(sink);

        let content = fs::read_to_string(&log_path)?;
        assert!(!content.contains("stale"));
        for line in ["out RM", "err RM", "out LT", "err LT"] {
            assert!(content.contains(line), "missing '{}' in {}", line, content);
        }
        Ok(())
    }
}
