//! Child-process supervision for a single build.
//!
//! A [`Build`] owns one invocation of the external build tool. Its merged
//! stdout/stderr is forwarded line by line as RUNNING packets by a background
//! task, which then waits for the exit status and reports the build id on the
//! session's completion channel.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{PacketKind, PacketWriter};

/// Session-unique identifier of a build.
pub type BuildId = u64;

/// The external tool invoked for every build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    /// Arguments placed before the ones supplied with each build request.
    pub leading_args: Vec<String>,
}

impl BuildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for BuildCommand {
    fn default() -> Self {
        Self::new("make")
    }
}

/// One supervised invocation of the build tool.
#[derive(Debug)]
pub struct Build {
    id: BuildId,
    pid: Option<u32>,
    exit: watch::Receiver<Option<i32>>,
    task: JoinHandle<()>,
}

impl Build {
    /// Spawn the build tool in `working_dir` with `args` appended.
    ///
    /// Stdin is disconnected and stdout/stderr share one pipe, so lines reach
    /// the peer in the order the child wrote them. The child gets its own
    /// process group so [`Build::stop`] reaches anything it spawns.
    pub fn start(
        id: BuildId,
        command: &BuildCommand,
        working_dir: &Path,
        args: &[String],
        writer: PacketWriter,
        completions: mpsc::UnboundedSender<BuildId>,
    ) -> Result<Self> {
        let (output_rx, output_tx) = io::pipe()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.leading_args)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(output_tx.try_clone()?)
            .stderr(output_tx)
            .process_group(0);

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: command.program.clone(),
            source,
        })?;
        // The command still holds the parent's copies of the write end; the
        // reader only sees end-of-stream once those are gone.
        drop(cmd);

        let pid = child.id();
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(output_rx))?;
        let (exit_tx, exit_rx) = watch::channel(None);

        info!(
            build_id = id,
            pid,
            program = %command.program,
            ?args,
            dir = %working_dir.display(),
            "build started"
        );

        let task = tokio::spawn(forward_output(id, child, output, writer, exit_tx, completions));

        Ok(Self {
            id,
            pid,
            exit: exit_rx,
            task,
        })
    }

    pub fn id(&self) -> BuildId {
        self.id
    }

    /// Exit code, once the child has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Ask the build to terminate with SIGTERM and return immediately.
    ///
    /// Termination is cooperative: a child that ignores the signal keeps
    /// running, and the completion notification is still delivered whenever
    /// it does exit.
    pub fn stop(&self) {
        if self.exit_code().is_some() {
            debug!(build_id = self.id, "build already exited; nothing to stop");
            return;
        }
        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            warn!(build_id = self.id, "build has no process id; cannot signal it");
            return;
        };

        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => info!(build_id = self.id, pid, "sent SIGTERM to build"),
            Err(nix::errno::Errno::ESRCH) => {
                debug!(build_id = self.id, pid, "build process group already gone");
            }
            Err(err) => warn!(build_id = self.id, pid, error = %err, "failed to signal build"),
        }
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// A child killed by signal `N` reports `-N`. Returns immediately when the
    /// child has already exited.
    pub async fn join(&self) -> i32 {
        let mut exit = self.exit.clone();
        let code = match exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        code.unwrap_or_else(|| {
            warn!(
                build_id = self.id,
                finished = self.task.is_finished(),
                "output task ended without recording an exit status"
            );
            -1
        })
    }
}

async fn forward_output(
    id: BuildId,
    mut child: Child,
    output: pipe::Receiver,
    writer: PacketWriter,
    exit: watch::Sender<Option<i32>>,
    completions: mpsc::UnboundedSender<BuildId>,
) {
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    let mut peer_gone = false;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                strip_line_ending(&mut line);
                if peer_gone {
                    continue;
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                if let Err(err) = writer.write_packet(PacketKind::Running, text).await {
                    // Keep draining so the child never blocks on a full pipe.
                    warn!(build_id = id, error = %err, "failed to forward build output");
                    peer_gone = true;
                }
            }
            Err(err) => {
                warn!(build_id = id, error = %err, "error reading build output");
                break;
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(err) => {
            warn!(build_id = id, error = %err, "failed to wait for build process");
            -1
        }
    };
    info!(build_id = id, exit_code = code, "build completed; notifying session");

    exit.send_replace(Some(code));
    if completions.send(id).is_err() {
        debug!(build_id = id, "session ended before build completion");
    }
}

fn strip_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}
