use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{NodeId, TransactionId};

/// Issues strictly increasing [`TransactionId`]s for one node.
///
/// The wall clock drives the millisecond component. When the clock stalls or
/// steps backwards the last millisecond is reused and the sequence bumped, so
/// ids from one generator never repeat or regress.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    node_id: NodeId,
    last: Mutex<(u64, u32)>,
}

impl TransactionIdGenerator {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last: Mutex::new((0, 0)),
        }
    }

    pub fn next_id(&self) -> TransactionId {
        self.next_at(now_millis())
    }

    fn next_at(&self, wall_millis: u64) -> TransactionId {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (last_millis, last_seq) = *last;
        let next = if wall_millis > last_millis {
            (wall_millis, 0)
        } else if last_seq == u32::MAX {
            (last_millis + 1, 0)
        } else {
            (last_millis, last_seq + 1)
        };
        *last = next;
        TransactionId::new(next.0, next.1, self.node_id)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_when_clock_stalls() {
        let generator = TransactionIdGenerator::new(7);
        let a = generator.next_at(100);
        let b = generator.next_at(100);
        let c = generator.next_at(90);
        let d = generator.next_at(101);
        assert!(a < b && b < c && c < d);
        assert_eq!(c, TransactionId::new(100, 2, 7));
        assert_eq!(d, TransactionId::new(101, 0, 7));
    }

    #[test]
    fn sequence_overflow_advances_millis() {
        let generator = TransactionIdGenerator::new(1);
        *generator.last.lock().unwrap() = (50, u32::MAX);
        assert_eq!(generator.next_at(50), TransactionId::new(51, 0, 1));
    }

    #[test]
    fn wall_clock_ids_are_monotonic() {
        let generator = TransactionIdGenerator::new(0);
        let mut previous = generator.next_id();
        for _ in 0..1000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
    }
}
