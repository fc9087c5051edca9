use std::collections::VecDeque;

/// A latency/throughput-limited pipeline stage.
///
/// `ports` servers accept work; a server becomes available again
/// `issue_latency` cycles after it accepted an item, and the item leaves the
/// stage `latency` cycles after it entered. Items leave in order, so a slow
/// head blocks everything behind it.
#[derive(Debug, Clone)]
pub struct Pipeline<T> {
    name: String,
    issue_latency: u64,
    latency: u64,
    server_ready: VecDeque<u64>,
    queue: VecDeque<(T, u64)>,
    last_arrival: u64,
}

impl<T> std::fmt::Display for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline({}, {} in flight, servers={:?})",
            self.name,
            self.queue.len(),
            self.server_ready
        )
    }
}

impl<T> Pipeline<T> {
    /// # Panics
    /// If there are no ports or the issue latency is zero.
    #[must_use]
    pub fn new(name: impl Into<String>, ports: usize, issue_latency: u64, latency: u64) -> Self {
        assert!(ports > 0, "pipeline needs at least one port");
        assert!(issue_latency >= 1, "pipeline issue latency must be at least 1");
        Self {
            name: name.into(),
            issue_latency,
            latency,
            server_ready: std::iter::repeat(0).take(ports).collect(),
            queue: VecDeque::new(),
            last_arrival: 0,
        }
    }

    /// Enqueue an item for `repeat` back-to-back accesses of the same resource.
    ///
    /// # Panics
    /// If no server is available in cycle `now`.
    pub fn enqueue(&mut self, item: T, now: u64, repeat: u32) {
        assert!(
            self.server_avail(now),
            "{}: enqueue without available server (front={:?}, now={})",
            self.name,
            self.server_ready.front(),
            now
        );
        for i in 0..u64::from(repeat) {
            self.server_ready.pop_front();
            self.server_ready.push_back(now + self.issue_latency * (i + 1));
        }
        let complete = now + self.latency * u64::from(repeat);
        self.queue.push_back((item, complete));
        log::trace!(
            "{}: enqueue (inter-arrival={}, ready at {})",
            self.name,
            now - self.last_arrival.min(now),
            complete
        );
        self.last_arrival = now;
    }

    #[must_use]
    pub fn server_avail(&self, now: u64) -> bool {
        self.server_ready.front().is_some_and(|ready| *ready <= now)
    }

    #[must_use]
    pub fn ready(&self, now: u64) -> bool {
        self.queue.front().is_some_and(|(_, ready)| *ready <= now)
    }

    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.queue.front().map(|(item, _)| item)
    }

    #[must_use]
    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.queue.front_mut().map(|(item, _)| item)
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.pop_front().map(|(item, _)| item)
    }

    /// Hold every server for one more cycle.
    pub fn stall(&mut self) {
        for ready in &mut self.server_ready {
            *ready += 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter().map(|(item, _)| item)
    }
}
