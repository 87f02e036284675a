//! One-shot parking primitive for sleeping workers.
//!
//! A [`SleepHelper`] is created fresh for every sleep; its [`WakeupToken`]
//! can be handed to another thread to release the sleeper. Notifying before
//! the sleep makes the sleep return immediately. Invalidation is by
//! destruction: once the token taken out of its published slot is dropped,
//! later notify attempts find nothing to wake, so a stale notification can
//! never leak into the next sleep (which uses a fresh pair).

use parking::{Parker, Unparker};

#[derive(Debug)]
pub(crate) struct SleepHelper {
    parker: Parker,
    unparker: Unparker,
}

impl SleepHelper {
    pub(crate) fn new() -> Self {
        let (parker, unparker) = parking::pair();
        SleepHelper { parker, unparker }
    }

    pub(crate) fn get_wakeup_token(&self) -> WakeupToken {
        WakeupToken {
            unparker: self.unparker.clone(),
        }
    }

    /// Blocks until the token is notified. Returns immediately if it
    /// already was.
    pub(crate) fn sleep(&self) {
        self.parker.park();
    }
}

/// Handle to wake the owner of the [`SleepHelper`] this was taken from.
#[derive(Debug, Clone)]
pub(crate) struct WakeupToken {
    unparker: Unparker,
}

impl WakeupToken {
    /// Releases the waiter if one is parked; otherwise the next `sleep` on
    /// the originating helper returns immediately.
    pub(crate) fn notify(&self) {
        self.unparker.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn notify_before_sleep() {
        let helper = SleepHelper::new();
        helper.get_wakeup_token().notify();

        let before = Instant::now();
        helper.sleep();
        assert!(before.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn notify_releases_sleeper() {
        let helper = SleepHelper::new();
        let token = helper.get_wakeup_token();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            token.notify();
        });

        helper.sleep();
        handle.join().unwrap();
    }

    #[test]
    fn notification_is_consumed() {
        let helper = SleepHelper::new();
        let token = helper.get_wakeup_token();

        token.notify();
        helper.sleep();

        // A second sleep needs a second notification.
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            token.notify();
        });
        let before = Instant::now();
        helper.sleep();
        assert!(before.elapsed() >= Duration::from_millis(3));
        handle.join().unwrap();
    }
}
