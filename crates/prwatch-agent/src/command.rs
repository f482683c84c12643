use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::warn;

/// An external agent program: prompt in on stdin, output lines out on stdout.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Start the program and hand it `prompt` on stdin, then close stdin.
    pub async fn spawn(&self, prompt: &str) -> Result<AgentStream> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn agent: {}", self.program))?;

        let mut stdin = child.stdin.take().context("failed to take stdin")?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .context("failed to write prompt to agent stdin")?;
        stdin.shutdown().await.context("failed to close agent stdin")?;
        drop(stdin);

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        Ok(AgentStream {
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr: Some(BufReader::new(stderr).lines()),
            program: self.program.clone(),
        })
    }
}

enum Pipe {
    Stdout(std::io::Result<Option<String>>),
    Stderr(std::io::Result<Option<String>>),
}

/// A running agent. Read stdout with [`next_line`](Self::next_line) until it
/// returns `None`, then collect the exit status with [`wait`](Self::wait).
/// Stderr is drained into the log as it arrives.
pub struct AgentStream {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    program: String,
}

impl AgentStream {
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let Some(stderr) = self.stderr.as_mut() else {
                return self.stdout.next_line().await.context("error reading agent stdout");
            };
            let next = tokio::select! {
                line = self.stdout.next_line() => Pipe::Stdout(line),
                line = stderr.next_line() => Pipe::Stderr(line),
            };
            match next {
                Pipe::Stdout(line) => return line.context("error reading agent stdout"),
                Pipe::Stderr(Ok(Some(l))) => {
                    if !l.is_empty() {
                        warn!(program = %self.program, "agent stderr: {l}");
                    }
                }
                Pipe::Stderr(_) => self.stderr = None,
            }
        }
    }

    pub async fn wait(mut self) -> Result<ExitStatus> {
        if let Some(mut stderr) = self.stderr.take() {
            while let Ok(Some(l)) = stderr.next_line().await {
                if !l.is_empty() {
                    warn!(program = %self.program, "agent stderr: {l}");
                }
            }
        }
        self.child.wait().await.context("failed to wait for agent")
    }
}
