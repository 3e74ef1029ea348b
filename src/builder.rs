// Builder contract and a concrete process-spawning implementation:
// spawn, pipe output, race completion against cancellation, SIGINT on cancel.

use core::fmt;
use std::ffi::OsString;
use std::process::Stdio;

use anyhow::{anyhow, Context};
use futures::future::{self, Either};
use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::refs::Ref;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed { exit_code: i32 },
    Canceled,
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { exit_code } => write!(f, "completed - exit code {exit_code}"),
            Self::Canceled => write!(f, "cancelled"),
        }
    }
}

/// Given a ref, yields a build activity producing output (ignored by the
/// core) and a terminal completion/error. Must be safe to invoke exactly
/// once per call; cancellation is signalled via `cancel`.
pub trait Builder: Send + Sync + 'static {
    fn run_build(
        &self,
        r: &Ref,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = anyhow::Result<BuildOutcome>> + Send;
}

/// Opaque command template threaded from configuration; the core never
/// inspects it.
#[derive(Clone, Debug)]
pub enum BuildCommand {
    Shell(String),
    Raw(Vec<String>),
}

impl BuildCommand {
    fn program(&self) -> OsString {
        match self {
            Self::Shell(_) => "bash".into(),
            Self::Raw(args) => args[0].clone().into(),
        }
    }

    fn args(&self) -> Vec<OsString> {
        match self {
            Self::Shell(cmd) => vec!["-c".into(), cmd.into()],
            Self::Raw(args) => args[1..].iter().map(OsString::from).collect(),
        }
    }
}

/// Runs the configured command as a child process, exposing the ref's name
/// and SHA via the environment so the command template can check out and
/// build the right state.
pub struct ProcessBuilder {
    name: String,
    command: BuildCommand,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>, command: BuildCommand) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

impl Builder for ProcessBuilder {
    async fn run_build(
        &self,
        r: &Ref,
        cancel: CancellationToken,
    ) -> anyhow::Result<BuildOutcome> {
        let mut cmd = Command::new(self.command.program());
        cmd.args(self.command.args())
            .env("BUILD_SHA", r.sha())
            .env("BUILD_REF", &r.name)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("[{}] launching build for {} ({})", self.name, r.name, r.sha());

        let child = cmd.spawn().context("spawning build command")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow!("no PID for build child"))?
                .try_into()
                .context("child PID out of range")?,
        );

        let child_fut = Box::pin(child.wait_with_output());
        let cancel_fut = Box::pin(cancel.cancelled());
        match future::select(child_fut, cancel_fut).await {
            Either::Left((output, _)) => {
                let output = output.context("waiting for build command")?;
                debug!(
                    "[{}] {} produced {} bytes stdout, {} bytes stderr",
                    self.name,
                    r.sha(),
                    output.stdout.len(),
                    output.stderr.len()
                );
                let exit_code = output
                    .status
                    .code()
                    .ok_or_else(|| anyhow!("build command killed by signal"))?;
                Ok(BuildOutcome::Completed { exit_code })
            }
            Either::Right((_, child_fut)) => {
                kill(pid, Signal::SIGINT).context("interrupting build command")?;
                let _ = child_fut.await;
                Ok(BuildOutcome::Canceled)
            }
        }
    }
}
