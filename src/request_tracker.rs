use std::collections::HashMap;

/// Active request count per cache set.
///
/// Level-one caches bound the number of requests that may be in flight
/// per set, because every miss eventually needs a way to fill into.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestTracker {
    active: HashMap<usize, usize>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_request(&mut self, set: usize) {
        let count = self.active.entry(set).or_insert(0);
        *count += 1;
        log::trace!("request tracker: set {} now has {} requests", set, *count);
    }

    /// # Panics
    /// If no request is active for the set.
    pub fn end_request(&mut self, set: usize) {
        let count = self
            .active
            .get_mut(&set)
            .unwrap_or_else(|| panic!("end of request for set {set} without active requests"));
        *count -= 1;
        if *count == 0 {
            self.active.remove(&set);
        }
    }

    #[must_use]
    pub fn active_requests(&self, set: usize) -> usize {
        self.active.get(&set).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::RequestTracker;

    #[test]
    fn test_counts_per_set() {
        let mut tracker = RequestTracker::new();
        tracker.start_request(3);
        tracker.start_request(3);
        tracker.start_request(5);
        assert_eq!(tracker.active_requests(3), 2);
        assert_eq!(tracker.active_requests(5), 1);
        assert_eq!(tracker.active_requests(7), 0);
        tracker.end_request(3);
        tracker.end_request(3);
        tracker.end_request(5);
        assert!(tracker.is_empty());
    }

    #[test]
    #[should_panic(expected = "without active requests")]
    fn test_end_without_start_is_fatal() {
        RequestTracker::new().end_request(1);
    }
}
