use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// "Schedule once, cancel-and-replace if already pending." Each call to
/// [`Debouncer::trigger`] bumps a generation counter; the sleeping worker
/// only fires the callback if its generation is still the newest one when
/// it wakes up, so a burst of triggers collapses into a single firing.
pub struct Debouncer {
    generation: AtomicU64,
    wake: Arc<(Mutex<u64>, Condvar)>,
    delay: Duration,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            generation: AtomicU64::new(0),
            wake: Arc::new((Mutex::new(0), Condvar::new())),
            delay,
        }
    }

    /// Schedules `callback` to run after the debounce delay, canceling any
    /// previously scheduled-but-not-yet-fired callback.
    pub fn trigger(&self, callback: impl FnOnce() + Send + 'static) {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let (lock, cvar) = &*self.wake;
            let mut latest = lock.lock().unwrap();
            *latest = my_generation;
            cvar.notify_all();
        }

        let wake = Arc::clone(&self.wake);
        let delay = self.delay;
        thread::spawn(move || {
            thread::sleep(delay);
            let (lock, _cvar) = &*wake;
            let latest = lock.lock().unwrap();
            if *latest == my_generation {
                drop(latest);
                callback();
            }
        });
    }
}
