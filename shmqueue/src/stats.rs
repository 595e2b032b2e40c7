use std::fmt;

/// Counters read from the control block without any coordination between
/// the four loads; treat as approximate.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueStats {
    /// Records ever pushed.
    pub in_count: i64,
    /// Records ever popped.
    pub out_count: i64,
    pub capacity: u64,
    /// Bytes held by unread records, headers included. Written by both sides.
    pub inuse_bytes: i64,
}

impl QueueStats {
    pub fn pending(&self) -> i64 {
        self.in_count - self.out_count
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in {} out {} capacity {} inuse_bytes {}",
            self.in_count, self.out_count, self.capacity, self.inuse_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_all_counters() {
        let stats = QueueStats {
            in_count: 10,
            out_count: 4,
            capacity: 10_200,
            inuse_bytes: 60,
        };
        assert_eq!(stats.to_string(), "in 10 out 4 capacity 10200 inuse_bytes 60");
        assert_eq!(stats.pending(), 6);
    }
}
