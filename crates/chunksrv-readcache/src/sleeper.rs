use std::sync::Mutex;
use std::time::Duration;

/// Abstracts the retry/backoff `sleep()` calls in the read loop so tests
/// can run the real retry arithmetic without actually blocking for up to
/// a minute per the no-valid-copies backoff.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, d: Duration);
}

pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Records requested durations instead of sleeping, for deterministic
/// tests of the retry/backoff schedule.
#[derive(Default)]
pub struct RecordingSleeper {
    pub calls: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, d: Duration) {
        self.calls.lock().unwrap().push(d);
    }
}
