use std::cmp;
use std::sync::Mutex;

/// LamportClock is the per-process logical clock carried in every envelope.
///
/// `tick()` is called before every send; `observe()` on every receive. Both
/// go through one mutex, so every value emitted by a process is unique.
pub struct LamportClock {
    value: Mutex<u64>,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(value: u64) -> Self {
        LamportClock {
            value: Mutex::new(value),
        }
    }

    /// Increment and return the new value. Call immediately before sending.
    pub fn tick(&self) -> u64 {
        let mut value = self.value.lock().expect("LamportClock.tick() mutex guard poison");
        *value += 1;
        *value
    }

    /// Merge a received clock value: `L <- max(L, seen) + 1`.
    pub fn observe(&self, seen: u64) -> u64 {
        let mut value = self
            .value
            .lock()
            .expect("LamportClock.observe() mutex guard poison");
        *value = cmp::max(*value, seen) + 1;
        *value
    }

    pub fn current(&self) -> u64 {
        *self.value.lock().expect("LamportClock.current() mutex guard poison")
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        let mut previous = 0;
        for _ in 0..100 {
            let value = clock.tick();
            assert!(value > previous);
            previous = value;
        }
    }

    #[test]
    fn observe_jumps_past_received_value() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.observe(50), 51);
        // A stale value still advances the clock.
        assert_eq!(clock.observe(3), 52);
    }

    #[test]
    fn concurrent_ticks_emit_unique_values() {
        let clock = Arc::new(LamportClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..200).map(|_| clock.tick()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().expect("tick thread panicked"));
        }
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }
}
