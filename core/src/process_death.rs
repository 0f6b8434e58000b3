// Ties child processes to the orchestrator: each child leads its own process
// group so signals reach the whole command pipeline, and on Linux the child
// gets SIGTERM if the orchestrator dies first.

#[cfg(unix)]
use std::io;

use tokio::process::Command;

/// Puts the child in its own process group and arranges the parent-death
/// signal where the platform supports it.
#[cfg(unix)]
pub(crate) fn configure_child(command: &mut Command) {
    command.process_group(0);

    #[cfg(target_os = "linux")]
    {
        let parent_pid = unsafe { libc::getpid() };
        // SAFETY: the closure only issues async-signal-safe libc calls.
        unsafe {
            command.pre_exec(move || {
                set_parent_death(parent_pid);
                Ok(())
            });
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn configure_child(_command: &mut Command) {}

/// Sets a death signal for the child process so it receives SIGTERM when the parent exits.
///
/// # Arguments
///
/// * `parent_pid` - PID of the parent process captured before fork.
#[cfg(target_os = "linux")]
fn set_parent_death(parent_pid: libc::pid_t) {
    unsafe {
        // Ignore errors for portability.
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        // The original parent died between fork and this call.
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}

/// Signals every process in the group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub(crate) fn signal_process_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
