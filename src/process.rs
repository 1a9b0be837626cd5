//! Child processes with enforced upper bounds.
//!
//! Every process the crate starts (tunnel helpers and task programs) goes
//! through [`spawn`], which puts the child at the head of its own process
//! group and applies a CPU-time rlimit. Teardown through [`terminate`] or
//! [`kill_and_reap`] signals the whole group and always waits on the child,
//! so neither descendants nor zombies are left behind. Dropping a
//! [`GroupChild`] kills the group as well.

use std::io;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Wall-clock and CPU-time budget of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Hard wall-clock budget.
    pub wall: Duration,
    /// CPU-time budget, enforced with `RLIMIT_CPU` on unix.
    pub cpu: Option<Duration>,
}

impl ProcessLimits {
    pub const fn new(wall: Duration, cpu: Option<Duration>) -> Self {
        Self { wall, cpu }
    }
}

/// How a supervised process ended.
#[derive(Debug)]
pub(crate) enum Supervised {
    /// Ran to completion on its own.
    Exited(Output),
    /// Outlived its wall-clock budget and was killed.
    TimedOut,
    /// Cancelled by its owner and killed.
    Cancelled,
}

/// A spawned child leading its own process group.
#[derive(Debug)]
pub(crate) struct GroupChild {
    pub(crate) child: Child,
    /// Cleared once the group has been swept.
    pgid: Option<u32>,
}

impl GroupChild {
    pub(crate) fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// SIGKILL whatever is left of the group. Called once the leader has
    /// been reaped, so stragglers holding our pipes go too.
    fn sweep(&mut self) {
        #[cfg(unix)]
        signal_group(self.pgid, nix::sys::signal::Signal::SIGKILL);
        self.pgid = None;
    }
}

impl Drop for GroupChild {
    fn drop(&mut self) {
        self.sweep();
    }
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    #[allow(clippy::cast_possible_wrap)]
    let group = Pid::from_raw(pgid as i32);
    if let Err(e) = killpg(group, signal) {
        // ESRCH: every member is gone already
        debug!("{} to process group {} failed: {}", signal, pgid, e);
    }
}

/// Spawn `argv` in a new process group with its stdout piped and the CPU
/// budget applied.
pub(crate) fn spawn(argv: &[String], limits: &ProcessLimits, stderr: Stdio) -> io::Result<GroupChild> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    #[cfg(unix)]
    if let Some(cpu) = limits.cpu {
        use nix::sys::resource::{setrlimit, Resource};

        let soft = cpu.as_secs().max(1);
        // SAFETY: runs between fork and exec. setrlimit(2) is
        // async-signal-safe, and neither nix's setrlimit wrapper nor
        // io::Error::from(Errno) allocates, so no lock can be taken here.
        // std exposes no safe hook for RLIMIT_CPU.
        unsafe {
            command.pre_exec(move || {
                setrlimit(Resource::RLIMIT_CPU, soft, soft + 1).map_err(io::Error::from)
            });
        }
    }

    let child = command.spawn()?;
    debug!("Spawned `{}` (pid {:?})", argv.join(" "), child.id());
    let pgid = child.id();
    Ok(GroupChild { child, pgid })
}

/// Wait for `process` to finish, collecting stdout and stderr, unless the
/// wall budget runs out or `cancel` fires first. In both of those cases the
/// group is killed and the child reaped before returning. Background
/// descendants still running when the child exits are killed too.
pub(crate) async fn supervise(
    mut process: GroupChild,
    wall: Duration,
    grace: Duration,
    cancel: &CancellationToken,
) -> io::Result<Supervised> {
    let stdout = process.child.stdout.take();
    let stderr = process.child.stderr.take();
    let pgid = process.pgid;

    enum Interrupt {
        Done(io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
        TimedOut,
        Cancelled,
    }

    let interrupt = {
        let child = &mut process.child;
        let exited = async move {
            let status = child.wait().await;
            // release the pipes held by stragglers
            #[cfg(unix)]
            signal_group(pgid, nix::sys::signal::Signal::SIGKILL);
            status
        };
        let collect = async { tokio::try_join!(exited, read_all(stdout), read_all(stderr)) };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Interrupt::Cancelled,
            finished = tokio::time::timeout(wall, collect) => match finished {
                Ok(result) => Interrupt::Done(result),
                Err(_) => Interrupt::TimedOut,
            },
        }
    };

    match interrupt {
        Interrupt::Done(result) => {
            process.sweep();
            let (status, stdout, stderr) = result?;
            Ok(Supervised::Exited(Output { status, stdout, stderr }))
        }
        Interrupt::TimedOut => {
            warn!("Process {:?} exceeded its wall-clock budget of {:?}", pgid, wall);
            kill_and_reap(&mut process).await;
            Ok(Supervised::TimedOut)
        }
        Interrupt::Cancelled => {
            debug!("Process {:?} cancelled", pgid);
            terminate(&mut process, grace).await;
            Ok(Supervised::Cancelled)
        }
    }
}

/// Ask the group to exit with SIGTERM, escalating to SIGKILL after `grace`.
/// Returns the leader's exit status once it has been reaped.
pub(crate) async fn terminate(process: &mut GroupChild, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = process.child.try_wait() {
        process.sweep();
        return Some(status);
    }
    let Some(pid) = process.child.id() else {
        let status = process.child.wait().await.ok();
        process.sweep();
        return status;
    };

    #[cfg(unix)]
    signal_group(process.pgid, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    {
        let _ = process.child.start_kill();
    }

    match tokio::time::timeout(grace, process.child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Process {} exited after SIGTERM ({})", pid, status);
            process.sweep();
            Some(status)
        }
        Ok(Err(e)) => {
            warn!("Error waiting for process {}: {}", pid, e);
            kill_and_reap(process).await
        }
        Err(_) => {
            warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
            kill_and_reap(process).await
        }
    }
}

/// Kill the whole group immediately and wait for the leader.
pub(crate) async fn kill_and_reap(process: &mut GroupChild) -> Option<ExitStatus> {
    #[cfg(unix)]
    signal_group(process.pgid, nix::sys::signal::Signal::SIGKILL);
    if let Err(e) = process.child.kill().await {
        debug!("Kill failed (process probably gone already): {}", e);
    }
    let status = process.child.wait().await.ok();
    process.sweep();
    status
}

/// Whether the process was stopped by the kernel for exhausting its CPU budget.
pub(crate) fn cpu_exhausted(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal() == Some(nix::sys::signal::Signal::SIGXCPU as i32)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
