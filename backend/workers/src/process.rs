//! External program invocation for the OCR model and the trainer.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::debug;

/// A program plus argument template. `{name}` in an argument is replaced by
/// the matching variable at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProgramOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), value)
                })
            })
            .collect()
    }

    /// Run to completion. A non-zero exit or a timeout is an error carrying stderr.
    pub async fn run(&self, vars: &[(&str, &str)]) -> anyhow::Result<ProgramOutput> {
        if self.program.trim().is_empty() {
            bail!("no program configured");
        }
        let args = self.render_args(vars);
        debug!(program = %self.program, ?args, "Running external program");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .with_context(|| format!("{} timed out after {}s", self.program, limit.as_secs()))?,
            None => cmd.output().await,
        }
        .with_context(|| format!("Failed to start {}", self.program))?;

        let result = ProgramOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !output.status.success() {
            bail!(
                "{} exited with {:?}: {}",
                self.program,
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let spec = CommandSpec::new(
            "ocr",
            vec!["--image={image}".into(), "{weights}".into(), "-q".into()],
        );
        let args = spec.render_args(&[("image", "/tmp/a.png"), ("weights", "w.pth")]);
        assert_eq!(args, vec!["--image=/tmp/a.png", "w.pth", "-q"]);
    }

    #[tokio::test]
    async fn empty_program_is_rejected() {
        let spec = CommandSpec::new("  ", vec![]);
        assert!(spec.run(&[]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_failures() {
        let ok = CommandSpec::new("sh", vec!["-c".into(), "echo {word}".into()]);
        let output = ok.run(&[("word", "hello")]).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");

        let failing = CommandSpec::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let err = failing.run(&[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_slow_programs() {
        let slow = CommandSpec::new("sleep", vec!["5".into()])
            .with_timeout(Some(Duration::from_millis(50)));
        let err = slow.run(&[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }
}
