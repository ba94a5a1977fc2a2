use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

/// A counting semaphore used to wake worker threads.
#[derive(Debug, Default)]
pub struct WorkSignal {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Waits until the signal is raised or the timeout expires. Returns `true` if a signal was
    /// consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap();
        let (mut count, _) = self
            .condvar
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Consumes all pending signals without blocking.
    pub fn drain(&self) {
        *self.count.lock().unwrap() = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Arc::new(WorkSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(5)))
        };
        signal.signal();
        assert!(waiter.join().unwrap());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }
}
