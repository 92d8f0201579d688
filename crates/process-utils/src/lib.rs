//! Child-process helpers shared across the workspace.
//!
//! - [`NoWindowExt`] keeps console windows from flashing up on Windows.
//! - [`terminate`] stops a tokio child politely first and forcefully after a grace period.

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<std::ffi::OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// How a child ended up stopping after [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The child had already exited before we signalled it.
    AlreadyExited,
    /// The child exited within the grace period after the polite signal.
    Graceful,
    /// The grace period elapsed (or no polite signal exists) and the child was killed.
    Killed,
}

/// Stop `child`, waiting at most `grace` for it to exit on its own.
///
/// On unix the child receives `SIGTERM` first. Elsewhere there is no polite
/// signal, so the child is killed right away.
#[cfg(feature = "tokio")]
pub async fn terminate(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<TerminateOutcome> {
    if child.try_wait()?.is_some() {
        return Ok(TerminateOutcome::AlreadyExited);
    }

    if send_sigterm(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                status?;
                return Ok(TerminateOutcome::Graceful);
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?child.id(),
                    grace_ms = grace.as_millis() as u64,
                    "Child ignored SIGTERM; killing"
                );
            }
        }
    }

    child.kill().await?;
    Ok(TerminateOutcome::Killed)
}

#[cfg(all(feature = "tokio", unix))]
fn send_sigterm(child: &tokio::process::Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we have not reaped yet, so it cannot
    // have been recycled for an unrelated process.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(all(feature = "tokio", not(unix)))]
fn send_sigterm(_child: &tokio::process::Child) -> bool {
    false
}

#[cfg(all(test, feature = "tokio", unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_sleeping_child_is_graceful() {
        let mut child = tokio_command("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let outcome = terminate(&mut child, Duration::from_secs(3)).await.unwrap();
        assert_eq!(outcome, TerminateOutcome::Graceful);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_kills_child_ignoring_sigterm() {
        let mut child = tokio_command("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = terminate(&mut child, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, TerminateOutcome::Killed);
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = tokio_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        let outcome = terminate(&mut child, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, TerminateOutcome::AlreadyExited);
    }
}
