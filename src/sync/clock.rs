//! Hybrid Logical Clock for causal ordering across devices.
//!
//! Combines physical wall-clock time with a logical counter to provide
//! monotonically increasing timestamps without requiring NTP agreement
//! between devices. Wire format: `"{wall_ms:013}:{counter:04}:{node_id}"` —
//! both numeric fields are zero-padded so lexicographic comparison of the
//! string form matches the numeric order. Changelog batch IDs reuse the
//! string form as a sortable prefix.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Zero-padding width for `wall_ms`: 13 digits covers epoch milliseconds
/// through the year 2286.
const WALL_MS_WIDTH: usize = 13;

/// Zero-padding width for `counter`.
const COUNTER_WIDTH: usize = 4;

/// A totally-ordered timestamp `(wall_ms, counter, node_id)`.
///
/// Ordering is lexicographic on the fields in declaration order, which the
/// derived `Ord` provides.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp {
    pub wall_ms: u64,
    pub counter: u16,
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn new(wall_ms: u64, counter: u16, node_id: impl Into<String>) -> Self {
        Self {
            wall_ms,
            counter,
            node_id: node_id.into(),
        }
    }

    /// The zero timestamp, smaller than anything a clock can mint.
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0wall$}:{:0ctr$}:{}",
            self.wall_ms,
            self.counter,
            self.node_id,
            wall = WALL_MS_WIDTH,
            ctr = COUNTER_WIDTH,
        )
    }
}

impl FromStr for HlcTimestamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (wall, counter, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(w), Some(c), Some(n)) => (w, c, n),
            _ => return Err(format!("invalid HLC timestamp: {s}")),
        };
        Ok(Self {
            wall_ms: wall
                .parse()
                .map_err(|_| format!("invalid HLC wall_ms: {s}"))?,
            counter: counter
                .parse()
                .map_err(|_| format!("invalid HLC counter: {s}"))?,
            node_id: node.to_string(),
        })
    }
}

impl Serialize for HlcTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HlcTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Default)]
struct ClockState {
    last_wall_ms: u64,
    counter: u16,
}

impl ClockState {
    /// Bump the counter, rolling into the next millisecond on overflow so
    /// the emitted timestamp is still strictly greater.
    fn increment(&mut self) {
        if self.counter == u16::MAX {
            self.last_wall_ms += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
    }

    fn set_counter(&mut self, value: u32) {
        if value > u16::MAX as u32 {
            self.last_wall_ms += 1;
            self.counter = 0;
        } else {
            self.counter = value as u16;
        }
    }
}

/// Thread-safe hybrid logical clock.
///
/// `now()` is strictly greater than every timestamp previously returned;
/// `receive(remote)` additionally exceeds the remote timestamp, so a device
/// that has observed an entry can never mint a timestamp behind it.
pub struct HybridLogicalClock {
    node_id: String,
    state: Mutex<ClockState>,
}

impl HybridLogicalClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(ClockState::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn physical_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Generate a new timestamp for a local event.
    pub fn now(&self) -> HlcTimestamp {
        let mut state = self.state.lock();
        let phys = Self::physical_ms();
        if phys > state.last_wall_ms {
            state.last_wall_ms = phys;
            state.counter = 0;
        } else {
            state.increment();
        }
        HlcTimestamp::new(state.last_wall_ms, state.counter, self.node_id.clone())
    }

    /// Ingest a remote timestamp; returns a fresh local timestamp strictly
    /// greater than both the remote and all prior local timestamps.
    pub fn receive(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let mut state = self.state.lock();
        let phys = Self::physical_ms();
        let merged = state.last_wall_ms.max(remote.wall_ms).max(phys);

        let next_counter: u32 =
            if merged == phys && merged > state.last_wall_ms && merged > remote.wall_ms {
                0
            } else if merged == state.last_wall_ms && merged == remote.wall_ms {
                state.counter.max(remote.counter) as u32 + 1
            } else if merged == remote.wall_ms {
                remote.counter as u32 + 1
            } else {
                state.counter as u32 + 1
            };

        state.last_wall_ms = merged;
        state.set_counter(next_counter);
        HlcTimestamp::new(state.last_wall_ms, state.counter, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let ts = HlcTimestamp::new(1_700_000_000_123, 7, "node-a");
        let s = ts.to_string();
        assert_eq!(s, "1700000000123:0007:node-a");
        let parsed: HlcTimestamp = s.parse().unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn string_form_is_zero_padded() {
        let early = HlcTimestamp::new(999, 0, "n");
        let late = HlcTimestamp::new(1000, 0, "n");
        // Lexicographic string order must match numeric order.
        assert!(early.to_string() < late.to_string());
        assert!(early < late);
    }

    #[test]
    fn ordering_is_total_on_the_triple() {
        let a = HlcTimestamp::new(1000, 0, "nodeA");
        let b = HlcTimestamp::new(1000, 0, "nodeB");
        let c = HlcTimestamp::new(1000, 1, "nodeA");
        assert!(a < b); // node_id tie-break
        assert!(b < c); // counter dominates node_id
        assert!(a < c);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-a-timestamp".parse::<HlcTimestamp>().is_err());
        assert!("123".parse::<HlcTimestamp>().is_err());
        assert!("x:y:z".parse::<HlcTimestamp>().is_err());
    }

    #[test]
    fn now_is_strictly_monotonic() {
        let clock = HybridLogicalClock::new("node-a");
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev, "{next} must exceed {prev}");
            prev = next;
        }
    }

    #[test]
    fn receive_exceeds_remote_and_local() {
        let clock = HybridLogicalClock::new("node-a");
        let before = clock.now();

        // A remote timestamp far in the future (clock skew).
        let remote = HlcTimestamp::new(before.wall_ms + 60_000, 42, "node-b");
        let merged = clock.receive(&remote);
        assert!(merged > remote);
        assert!(merged > before);
        assert_eq!(merged.wall_ms, remote.wall_ms);
        assert_eq!(merged.counter, 43);

        // Subsequent local timestamps stay ahead of the skewed remote.
        let after = clock.now();
        assert!(after > merged);
    }

    #[test]
    fn receive_remote_in_past_still_advances() {
        let clock = HybridLogicalClock::new("node-a");
        let local = clock.now();
        let stale = HlcTimestamp::new(1000, 0, "node-b");
        let merged = clock.receive(&stale);
        assert!(merged > stale);
        assert!(merged > local);
    }

    #[test]
    fn receive_same_wall_ms_takes_max_counter() {
        let clock = HybridLogicalClock::new("node-a");
        let local = clock.now();
        let remote = HlcTimestamp::new(local.wall_ms, local.counter + 10, "node-b");
        let merged = clock.receive(&remote);
        assert!(merged.counter > remote.counter || merged.wall_ms > remote.wall_ms);
        assert!(merged > remote);
    }

    #[test]
    fn timestamps_interleaved_across_clocks_stay_ordered() {
        let a = HybridLogicalClock::new("nodeA");
        let b = HybridLogicalClock::new("nodeB");

        let t1 = a.now();
        let t2 = b.receive(&t1);
        let t3 = a.receive(&t2);
        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn serde_uses_wire_string() {
        let ts = HlcTimestamp::new(1000, 0, "nodeA");
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"0000000001000:0000:nodeA\"");
        let back: HlcTimestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
