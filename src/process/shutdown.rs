//! SIGTERM then SIGKILL teardown for backend children.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// How long a child gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Stop a child, escalating to SIGKILL after `grace`, and reap it.
pub async fn shutdown_child(mut child: Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        terminate(&mut child, grace).await
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    tracing::debug!(pid, "child ignored SIGTERM, sending SIGKILL");
    child.kill().await?;
    child.wait().await
}
