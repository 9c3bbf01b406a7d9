use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::errors::CommandError;

/// Receives each decoded chunk of process output as soon as it is read.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Everything a successful command wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over external command execution for testability.
/// Real implementation: `ProcessRunner`. Test double: `ScriptedRunner`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `cwd`, pushing every chunk of stdout and
    /// stderr to `on_chunk` as it arrives. No timeout is applied.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Transcript, CommandError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

const READ_BUFFER: usize = 8 * 1024;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Transcript, CommandError> {
        let io_err = |source| CommandError::Io {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stdout was not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stderr was not captured")))?;

        let mut transcript = Transcript::default();
        let mut out_buf = vec![0u8; READ_BUFFER];
        let mut err_buf = vec![0u8; READ_BUFFER];
        let mut out_decoder = Utf8Chunker::default();
        let mut err_decoder = Utf8Chunker::default();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => {
                    let n = read.map_err(io_err)?;
                    let text = if n == 0 {
                        out_open = false;
                        out_decoder.finish()
                    } else {
                        out_decoder.push(&out_buf[..n])
                    };
                    if !text.is_empty() {
                        tracing::trace!(program, stream = "stdout", bytes = text.len(), "chunk");
                        on_chunk(&text);
                        transcript.stdout.push_str(&text);
                    }
                }
                read = stderr.read(&mut err_buf), if err_open => {
                    let n = read.map_err(io_err)?;
                    let text = if n == 0 {
                        err_open = false;
                        err_decoder.finish()
                    } else {
                        err_decoder.push(&err_buf[..n])
                    };
                    if !text.is_empty() {
                        tracing::trace!(program, stream = "stderr", bytes = text.len(), "chunk");
                        on_chunk(&text);
                        transcript.stderr.push_str(&text);
                    }
                }
            }
        }

        let status = child.wait().await.map_err(io_err)?;
        if status.success() {
            Ok(transcript)
        } else {
            Err(CommandError::NonZeroExit {
                program: program.to_string(),
                code: status.code(),
                stderr: transcript.stderr,
            })
        }
    }
}

/// Decodes a byte stream into UTF-8 text, holding back a multi-byte
/// character split across two reads until its remaining bytes arrive.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let cut = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(cut);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

// ── Scripted runner ──────────────────────────────────────────────────

/// One call observed by a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    /// `program arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
enum Script {
    Respond { stdout: String },
    Fail { code: i32, stderr: String },
}

/// Deterministic [`CommandRunner`] that never spawns a process.
///
/// Rules match on the start of the invocation's command line; the first
/// matching rule wins. Unmatched commands succeed silently. Used by the
/// test suites and by `onboard serve --dry-run`.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, Script)>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands starting with `prefix`.
    pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
        self.rules.push((
            prefix.to_string(),
            Script::Respond {
                stdout: stdout.to_string(),
            },
        ));
        self
    }

    /// Exit with `code` and `stderr` for commands starting with `prefix`.
    pub fn fail_on(mut self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.rules.push((
            prefix.to_string(),
            Script::Fail {
                code,
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    /// Every invocation so far, in call order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Command lines of every invocation so far, in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Transcript, CommandError> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        };
        let line = invocation.command_line();
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(invocation);
        }

        let script = self
            .rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, script)| script.clone());

        match script {
            Some(Script::Fail { code, stderr }) => {
                on_chunk(&stderr);
                Err(CommandError::NonZeroExit {
                    program: program.to_string(),
                    code: Some(code),
                    stderr,
                })
            }
            Some(Script::Respond { stdout }) => {
                if !stdout.is_empty() {
                    on_chunk(&stdout);
                }
                Ok(Transcript {
                    stdout,
                    stderr: String::new(),
                })
            }
            None => Ok(Transcript::default()),
        }
    }
}
