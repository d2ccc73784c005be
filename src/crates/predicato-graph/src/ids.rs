//! Time-ordered identifier allocation.
//!
//! All graph elements are keyed by UUIDv7, which embeds a millisecond
//! timestamp in the most significant bits so identifiers sort by creation
//! time. A single process-wide [`ContextV7`] provides the counter bits that
//! keep ids monotonic even when several are minted within the same
//! millisecond. Uniqueness within a group follows from uniqueness of the
//! ids themselves.

use std::sync::{Mutex, OnceLock};

use uuid::{ClockSequence, ContextV7, Timestamp, Uuid};

struct SharedContextV7(Mutex<ContextV7>);

impl ClockSequence for SharedContextV7 {
    type Output = u64;

    fn generate_sequence(&self, seconds: u64, subsec_nanos: u32) -> Self::Output {
        self.0
            .lock()
            .unwrap()
            .generate_sequence(seconds, subsec_nanos)
    }
}

fn context() -> &'static SharedContextV7 {
    static CONTEXT: OnceLock<SharedContextV7> = OnceLock::new();
    CONTEXT.get_or_init(|| SharedContextV7(Mutex::new(ContextV7::new())))
}

/// Allocate a new time-ordered UUID.
pub fn new_uuid() -> Uuid {
    Uuid::new_v7(Timestamp::now(context()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = new_uuid();
        let b = new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_are_monotonic_in_process() {
        let mut previous = new_uuid();
        for _ in 0..1000 {
            let next = new_uuid();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }
}
