//! Process liveness probes for hook and lock staleness checks.

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    #[cfg(unix)]
    fn absurd_pid_is_not_running() {
        // Max pid on Linux is far below this.
        assert!(!is_process_running(4_000_000));
    }
}
