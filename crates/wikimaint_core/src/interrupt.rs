use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Operator cancel flag. Set from a signal handler, polled by the run loop
/// between windows and by every wait inside it.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    requested: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early once triggered. Returns true when
    /// the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let handler_side = interrupt.clone();
        assert!(!interrupt.is_triggered());
        handler_side.trigger();
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn sleep_runs_to_the_deadline_when_untouched() {
        let interrupt = Interrupt::new();
        let started = Instant::now();
        assert!(!interrupt.sleep(Duration::from_millis(5)));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn sleep_wakes_early_once_triggered() {
        let interrupt = Interrupt::new();
        let handler_side = interrupt.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handler_side.trigger();
        });
        let started = Instant::now();
        assert!(interrupt.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        trigger.join().expect("trigger thread");
    }
}
