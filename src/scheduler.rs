use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Dispenses one of a fixed set of independent evaluator slots per
/// concurrent scenario evaluation. The free list lives under a single
/// lock; a caller that finds no free slot yields briefly and retries, so
/// the only guarantee is first-available by index.
pub struct ScenarioScheduler {
    free: Mutex<Vec<bool>>,
    waiting_time: Duration,
}

impl ScenarioScheduler {
    pub fn new(num_slots: usize) -> Self {
        assert!(num_slots > 0, "at least one evaluator slot is required");
        Self {
            free: Mutex::new(vec![true; num_slots]),
            waiting_time: Duration::from_micros(100),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Acquires a free slot, blocking the calling thread until one is
    /// available. The slot is released when the returned guard is
    /// dropped, on every exit path.
    pub fn acquire(&self) -> SlotGuard<'_> {
        loop {
            if let Some(slot) = self.try_acquire() {
                return SlotGuard {
                    scheduler: self,
                    slot,
                };
            }
            thread::sleep(self.waiting_time);
        }
    }

    fn try_acquire(&self) -> Option<usize> {
        let mut free = self.free.lock().unwrap();
        let slot = free.iter().position(|&is_free| is_free)?;
        free[slot] = false;
        Some(slot)
    }

    fn release(&self, slot: usize) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free[slot], "slot {slot} released twice");
        free[slot] = true;
    }
}

/// Exclusive handle to an evaluator slot. Dropping the guard marks the
/// slot free again.
pub struct SlotGuard<'a> {
    scheduler: &'a ScenarioScheduler,
    slot: usize,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.release(self.slot);
    }
}
