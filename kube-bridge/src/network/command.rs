//! Thin abstraction over running OS networking commands

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if present, otherwise stdout (some tools report errors on stdout)
    pub fn error_message(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Runs a program to completion.
///
/// A non-zero exit is reported through [`CommandOutput::exit_code`], not as an
/// error; errors mean the program could not be run or timed out.
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        stdin: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        stdin: Option<&'a str>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            debug!("Running {} {}", program, args.join(" "));

            let mut child = Command::new(program)
                .args(args)
                .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                // closing stdin lets tools like `pfctl -f -` finish reading
                drop(pipe);
            }

            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| Error::CommandTimeout {
                    command: format!("{} {}", program, args.join(" ")),
                    timeout,
                })??;

            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// One recorded invocation: program, args, stdin.
    pub type Invocation = (String, Vec<String>, Option<String>);

    /// Records every command and answers with a fixed exit code.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingRunner {
        pub invocations: Arc<Mutex<Vec<Invocation>>>,
        pub exit_code: i32,
        pub stdout: String,
    }

    impl RecordingRunner {
        pub fn failing(exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Default::default()
            }
        }

        pub fn commands(&self) -> Vec<Invocation> {
            self.invocations.lock().unwrap().clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.commands()
                .into_iter()
                .map(|(program, args, _)| format!("{} {}", program, args.join(" ")))
                .collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run<'a>(
            &'a self,
            program: &'a str,
            args: &'a [String],
            stdin: Option<&'a str>,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<CommandOutput>> {
            self.invocations.lock().unwrap().push((
                program.to_string(),
                args.to_vec(),
                stdin.map(str::to_string),
            ));
            let output = CommandOutput {
                exit_code: self.exit_code,
                stdout: self.stdout.clone(),
                stderr: if self.exit_code == 0 {
                    String::new()
                } else {
                    "permission denied".to_string()
                },
            };
            Box::pin(async move { Ok(output) })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let out = SystemCommandRunner
            .run("sh", &["-c".into(), "echo hi; exit 3".into()], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = SystemCommandRunner
            .run("cat", &[], Some("rdr pass\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "rdr pass\n");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = SystemCommandRunner
            .run("sleep", &["5".into()], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }
}
