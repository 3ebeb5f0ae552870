//! Test execution runner
//!
//! Spawns one test program, streams its output through the TAP parser while it
//! runs, and classifies abnormal termination into a [`TestResult`].

use std::io::{BufRead, BufReader, PipeReader};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::models::{StderrMode, TestAssignment, TestResult};
use crate::tap::{ParseError, Parser};
use crate::utils::shell::{self, SplitError};
use crate::utils::Timer;

/// Failures that prevent a test program from producing a stream at all
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("invalid command template: {0}")]
    InvalidCommand(#[from] SplitError),

    #[error("command template is empty")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create output pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("output parser stopped unexpectedly: {0}")]
    ParserLost(String),
}

/// Test runner for line-protocol test programs
#[derive(Clone, Debug, Default)]
pub struct TestRunner;

impl TestRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run one assignment. Never fails: every problem becomes a failing result.
    pub async fn run(&self, assignment: &TestAssignment) -> TestResult {
        let timer = Timer::start(format!("run {}", assignment.path));

        let result = match self.execute(assignment).await {
            Ok(result) => result,
            Err(e) => {
                error!("{}: {}", assignment.path, e);
                TestResult::error(e)
            }
        };

        result.with_duration(timer.stop())
    }

    async fn execute(&self, assignment: &TestAssignment) -> Result<TestResult, ExecError> {
        let mut argv = shell::split(&assignment.exec)?;
        if argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        argv.push(assignment.path.clone());

        // stdout and a merged stderr share one pipe so the parser sees the
        // child's write order
        let (reader, writer) = std::io::pipe().map_err(ExecError::Pipe)?;
        let stderr = match assignment.stderr {
            StderrMode::Mirror => Stdio::inherit(),
            StderrMode::Merge => Stdio::from(writer.try_clone().map_err(ExecError::Pipe)?),
            StderrMode::Quiet => Stdio::null(),
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(assignment.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(stderr)
            .kill_on_drop(true);

        debug!("exec {:?}", argv);
        let spawned = cmd.spawn();
        // release the parent's write ends, otherwise the reader never sees EOF
        drop(cmd);
        let mut child = spawned.map_err(|source| ExecError::Spawn {
            program: argv[0].clone(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || forward_lines(reader, tx));

        // parse concurrently so a chatty child never blocks on a full pipe
        let parsing = tokio::spawn(parse_stream(rx));
        let status = child.wait().await;
        let parsed = parsing
            .await
            .map_err(|e| ExecError::ParserLost(e.to_string()))?;

        let mut result = match parsed {
            Ok(result) => result,
            Err(e) => return Ok(TestResult::error(format!("parse error: {e}"))),
        };

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => match status.code() {
                Some(code) => result.fail_with(format!("Test died with return code {code}"), ""),
                None => result.fail_with("unexpected error", status.to_string()),
            },
            Err(e) => result.fail_with("unexpected error", e.to_string()),
        }

        Ok(result)
    }
}

/// Copy lines from the child pipe into the parser channel until EOF
fn forward_lines(reader: PipeReader, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches('\n').to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("read error on child pipe: {}", e);
                break;
            }
        }
    }
}

/// Feed every line to the parser, keeping the channel drained after an error
async fn parse_stream(mut rx: mpsc::UnboundedReceiver<String>) -> Result<TestResult, ParseError> {
    let mut parser = Parser::new();
    let mut failure = None;

    while let Some(line) = rx.recv().await {
        if failure.is_none() {
            if let Err(e) = parser.push_line(&line) {
                failure = Some(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => parser.finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn assignment(file: &NamedTempFile) -> TestAssignment {
        TestAssignment::new(file.path().to_string_lossy(), "sh")
            .with_env(std::env::vars().collect())
            .with_stderr(StderrMode::Quiet)
    }

    #[tokio::test]
    async fn test_run_success() {
        let file = script("echo '1..1'\necho 'ok 1'\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(result.ok);
        assert_eq!(result.tests.len(), 1);
    }

    #[tokio::test]
    async fn test_run_fail() {
        let file = script("echo '1..1'\necho 'not ok 1'\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 1);
    }

    #[tokio::test]
    async fn test_run_fail_plan() {
        let file = script("echo '1..2'\necho 'ok 1'\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 2);
        assert!(result.tests[0].ok);
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let file = script("echo '1..1'\necho 'ok 1'\nexit 3\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 2);
        assert_eq!(result.tests[1].description, "Test died with return code 3");
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let file = script("echo '1..1'\n");
        let mut assignment = assignment(&file);
        assignment.exec = "definitely-not-a-real-interpreter-xyz".to_string();

        let result = TestRunner::new().run(&assignment).await;
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 1);
        assert!(result.tests[0].diagnostic.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_run_malformed_stream() {
        let file = script("echo '1..1'\necho '1..1'\necho 'ok 1'\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(!result.ok);
        assert_eq!(result.tests.len(), 1);
        assert!(result.tests[0].diagnostic.starts_with("parse error"));
    }

    #[tokio::test]
    async fn test_run_merged_stderr_keeps_write_order() {
        let file = script(
            "echo '1..200'\ni=1\nwhile [ $i -le 200 ]; do echo \"ok $i\"; echo \"# diag $i\" >&2; i=$((i+1)); done\n",
        );
        let result = TestRunner::new()
            .run(&assignment(&file).with_stderr(StderrMode::Merge))
            .await;
        assert!(result.ok);
        assert_eq!(result.tests.len(), 200);
        for line in &result.tests {
            assert_eq!(line.diagnostic, format!("diag {}", line.num));
        }
    }

    #[tokio::test]
    async fn test_run_quiet_discards_stderr() {
        let file = script("echo '1..1'\necho 'not ok 2' >&2\necho 'ok 1'\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(result.ok);
        assert_eq!(result.tests.len(), 1);
    }

    #[tokio::test]
    async fn test_run_large_output() {
        let file = script("echo '1..5000'\ni=1\nwhile [ $i -le 5000 ]; do echo \"ok $i - padding padding padding\"; i=$((i+1)); done\n");
        let result = TestRunner::new().run(&assignment(&file)).await;
        assert!(result.ok);
        assert_eq!(result.tests.len(), 5000);
    }

    #[tokio::test]
    async fn test_run_uses_assignment_env() {
        let file = script("echo '1..1'\nif [ \"$LANE_MARK\" = yes ]; then echo 'ok 1'; else echo 'not ok 1'; fi\n");
        let mut assignment = assignment(&file);
        assignment.env.push(("LANE_MARK".to_string(), "yes".to_string()));
        let result = TestRunner::new().run(&assignment).await;
        assert!(result.ok);
    }
}
