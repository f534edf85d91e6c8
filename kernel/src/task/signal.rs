//! Signal numbers (CloudABI numbering).
//!
//! Userland cannot install handlers, so a signal either terminates the
//! process or is ignored.

pub type Signal = u8;

pub const SIGABRT: Signal = 1;
pub const SIGALRM: Signal = 2;
pub const SIGBUS: Signal = 3;
pub const SIGCHLD: Signal = 4;
pub const SIGCONT: Signal = 5;
pub const SIGFPE: Signal = 6;
pub const SIGHUP: Signal = 7;
pub const SIGILL: Signal = 8;
pub const SIGINT: Signal = 9;
pub const SIGKILL: Signal = 10;
pub const SIGPIPE: Signal = 11;
pub const SIGQUIT: Signal = 12;
pub const SIGSEGV: Signal = 13;
pub const SIGSTOP: Signal = 14;
pub const SIGSYS: Signal = 15;
pub const SIGTERM: Signal = 16;
pub const SIGTRAP: Signal = 17;
pub const SIGTSTP: Signal = 18;
pub const SIGTTIN: Signal = 19;
pub const SIGTTOU: Signal = 20;
pub const SIGURG: Signal = 21;
pub const SIGUSR1: Signal = 22;
pub const SIGUSR2: Signal = 23;
pub const SIGVTALRM: Signal = 24;
pub const SIGXCPU: Signal = 25;
pub const SIGXFSZ: Signal = 26;

/// Whether delivering `signal` ends the process.
pub fn is_terminating(signal: Signal) -> bool {
    matches!(
        signal,
        SIGABRT
            | SIGALRM
            | SIGBUS
            | SIGFPE
            | SIGHUP
            | SIGILL
            | SIGINT
            | SIGKILL
            | SIGQUIT
            | SIGSEGV
            | SIGSYS
            | SIGTERM
            | SIGTRAP
            | SIGUSR1
            | SIGUSR2
            | SIGVTALRM
            | SIGXCPU
            | SIGXFSZ
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminating_set() {
        assert!(is_terminating(SIGKILL));
        assert!(is_terminating(SIGSEGV));
        assert!(!is_terminating(SIGCHLD));
        assert!(!is_terminating(SIGPIPE));
        assert!(!is_terminating(0));
        assert!(!is_terminating(200));
        assert_eq!((1..=26).filter(|&s| is_terminating(s)).count(), 18);
    }
}
