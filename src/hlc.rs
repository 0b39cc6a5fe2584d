//! Hybrid logical clock: 48-bit wall-clock milliseconds packed with a
//! 16-bit intra-millisecond counter into a single monotonic `u64`.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;
const PHYSICAL_MASK: u64 = !COUNTER_MASK;

/// A packed HLC timestamp. Ordered by plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp(pub u64);

impl HlcTimestamp {
    pub fn pack(physical_ms: u64, counter: u16) -> Self {
        HlcTimestamp((physical_ms << COUNTER_BITS) | counter as u64)
    }

    pub fn physical_ms(self) -> u64 {
        (self.0 & PHYSICAL_MASK) >> COUNTER_BITS
    }

    pub fn counter(self) -> u16 {
        (self.0 & COUNTER_MASK) as u16
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(v: u64) -> Self {
        HlcTimestamp(v)
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct ClockState {
    physical_ms: u64,
    counter: u16,
}

/// Thread-safe hybrid logical clock, one per database handle.
pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                physical_ms: 0,
                counter: 0,
            }),
        }
    }

    /// Produce the next timestamp, strictly greater than every timestamp
    /// previously returned by this clock.
    pub fn now(&self) -> HlcTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let wall = wall_clock_ms();

        if wall > state.physical_ms {
            state.physical_ms = wall;
            state.counter = 0;
        } else if state.counter == u16::MAX {
            // Counter exhausted within this millisecond: force physical time
            // forward so we never wrap back to counter 0 at the same ms.
            state.physical_ms += 1;
            state.counter = 0;
        } else {
            state.counter += 1;
        }

        HlcTimestamp::pack(state.physical_ms, state.counter)
    }

    /// Merge in a timestamp observed from another device. The result is
    /// strictly greater than both the clock's prior state and `received`.
    pub fn update(&self, received: HlcTimestamp) -> HlcTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let wall = wall_clock_ms();

        let max_physical = wall.max(state.physical_ms).max(received.physical_ms());

        let (next_counter, overflowed) = if max_physical == state.physical_ms && max_physical == received.physical_ms() {
            state.counter.max(received.counter()).overflowing_add(1)
        } else if max_physical == state.physical_ms {
            state.counter.overflowing_add(1)
        } else if max_physical == received.physical_ms() {
            received.counter().overflowing_add(1)
        } else {
            (0, false)
        };

        if overflowed {
            // Counter wrapped from u16::MAX: bump physical time instead of
            // reusing a counter value already seen at this instant.
            state.physical_ms = max_physical + 1;
            state.counter = 0;
        } else {
            state.physical_ms = max_physical;
            state.counter = next_counter;
        }

        HlcTimestamp::pack(state.physical_ms, state.counter)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
