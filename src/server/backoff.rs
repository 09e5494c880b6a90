use std::cmp::min;
use std::io;
use std::time::Duration;

/// Out of file descriptors, system wide and per process. The values are the same on Linux and
///  the BSDs.
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(windows)]
const WSAEMFILE: i32 = 10024;

/// Delay between retries of a failing `accept()` or dial. It starts small and doubles with
///  every consecutive failure up to a maximum, and it starts over after a success.
pub struct Backoff {
    current: Option<Duration>,

    config_initial_delay: Duration,
    config_max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(5), Duration::from_secs(1))
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Backoff {
            current: None,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
        }
    }

    /// the delay to wait before the next attempt after another failure
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.config_initial_delay,
            Some(d) => min(d * 2, self.config_max_delay),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Errors that affect a single pending connection or are caused by temporary resource
    ///  exhaustion. The accept loop backs off and retries after these, and gives up on any
    ///  other error.
    pub fn is_transient(e: &io::Error) -> bool {
        match e.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => true,
            // may resolve when other connections are closed
            _ => e.raw_os_error().is_some_and(Self::is_out_of_file_descriptors),
        }
    }

    #[cfg(unix)]
    fn is_out_of_file_descriptors(code: i32) -> bool {
        code == ENFILE || code == EMFILE
    }

    #[cfg(windows)]
    fn is_out_of_file_descriptors(code: i32) -> bool {
        code == WSAEMFILE
    }

    #[cfg(not(any(unix, windows)))]
    fn is_out_of_file_descriptors(_code: i32) -> bool {
        false
    }
}
