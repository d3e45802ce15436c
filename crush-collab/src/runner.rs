//! Execution seam for `run` requests.
//!
//! The relay never runs code itself. It hands the submitted text to a
//! [`CodeRunner`] on its own task and broadcasts the returned output.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use crush_core::language::Language;
use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default wall-clock limit for one [`LocalRunner`] execution.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Unsupported language: {0}")]
    Unsupported(Language),
    #[error("Execution failed: {0}")]
    Failed(String),
    #[error("Execution timed out after {0:?}")]
    TimedOut(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs submitted code and returns its newline-delimited output.
pub trait CodeRunner: Send + Sync + 'static {
    fn run(&self, language: Language, code: String) -> BoxFuture<'static, Result<String, RunError>>;
}

/// Synchronous closures run inline; keep them quick.
impl<F> CodeRunner for F
where
    F: Fn(Language, &str) -> Result<String, RunError> + Send + Sync + 'static,
{
    fn run(&self, language: Language, code: String) -> BoxFuture<'static, Result<String, RunError>> {
        future::ready(self(language, &code)).boxed()
    }
}

/// Interpreter invocation for one language; the code is written to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl InterpreterCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// Runs code with locally installed interpreters.
///
/// The default table covers Python, Ruby, Perl, PHP and JavaScript, each of
/// which reads a program from stdin. Java needs a compile step and a class
/// file on disk, so it is left out; add a wrapper script with
/// [`LocalRunner::with_command`] to enable it.
///
/// Every run is killed once it exceeds the timeout. No sandboxing: only
/// enable it for trusted rooms.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    commands: HashMap<Language, InterpreterCommand>,
    timeout: Duration,
}

impl Default for LocalRunner {
    fn default() -> Self {
        let commands = HashMap::from([
            (Language::Python, InterpreterCommand::new("python3", &["-"])),
            (Language::Ruby, InterpreterCommand::new("ruby", &[])),
            (Language::Perl, InterpreterCommand::new("perl", &[])),
            (Language::Php, InterpreterCommand::new("php", &[])),
            (Language::JavaScript, InterpreterCommand::new("node", &[])),
        ]);
        Self {
            commands,
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl LocalRunner {
    /// A runner with no languages configured.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_command(mut self, language: Language, command: InterpreterCommand) -> Self {
        self.commands.insert(language, command);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn supports(&self, language: Language) -> bool {
        self.commands.contains_key(&language)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl CodeRunner for LocalRunner {
    fn run(&self, language: Language, code: String) -> BoxFuture<'static, Result<String, RunError>> {
        let command = self.commands.get(&language).cloned();
        let limit = self.timeout;
        async move {
            let command = command.ok_or(RunError::Unsupported(language))?;
            match tokio::time::timeout(limit, execute(&command, &code)).await {
                Ok(result) => result,
                Err(_) => {
                    // Dropping the execution future kills the child.
                    log::warn!("{} exceeded {limit:?}; killed", command.program);
                    Err(RunError::TimedOut(limit))
                }
            }
        }
        .boxed()
    }
}

async fn execute(command: &InterpreterCommand, code: &str) -> Result<String, RunError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(code.as_bytes()).await {
            // The program may exit without reading all of its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            other => other?,
        }
    }
    let output = child.wait_with_output().await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    log::debug!(
        "{} exited with {} ({} bytes of output)",
        command.program,
        output.status,
        text.len()
    );
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_runner() {
        let runner = |language: Language, code: &str| -> Result<String, RunError> {
            Ok(format!("{language}: {}", code.len()))
        };
        assert_eq!(
            runner.run(Language::Ruby, "puts 1".into()).await.unwrap(),
            "Ruby: 6"
        );
    }

    #[tokio::test]
    async fn test_local_runner_unsupported_language() {
        let runner = LocalRunner::default();
        assert!(!runner.supports(Language::Java));
        assert_eq!(runner.timeout(), DEFAULT_RUN_TIMEOUT);
        assert!(matches!(
            runner.run(Language::Java, "class A {}".into()).await,
            Err(RunError::Unsupported(Language::Java))
        ));
    }

    #[tokio::test]
    async fn test_local_runner_missing_program_is_io_error() {
        let runner = LocalRunner::empty().with_command(
            Language::Python,
            InterpreterCommand::new("crush-no-such-interpreter", &[]),
        );
        assert!(matches!(
            runner.run(Language::Python, "print(1)".into()).await,
            Err(RunError::Io(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_runner_collects_stdout() {
        let runner =
            LocalRunner::empty().with_command(Language::Perl, InterpreterCommand::new("cat", &[]));
        assert_eq!(
            runner.run(Language::Perl, "echo\nback".into()).await.unwrap(),
            "echo\nback"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_runner_kills_runaway_program() {
        let runner = LocalRunner::empty()
            .with_command(Language::Ruby, InterpreterCommand::new("sleep", &["30"]))
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = runner.run(Language::Ruby, "loop {}".into()).await;
        assert!(matches!(result, Err(RunError::TimedOut(limit)) if limit == Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
