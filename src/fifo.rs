use std::collections::VecDeque;

/// Bounded message queue with admission reservations.
///
/// Every queued item also counts against the reserve, so `full` answers
/// "can one more producer be admitted" rather than "is there a free slot
/// right now". Each entry remembers the cycle it was enqueued in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageQueue<T> {
    inner: VecDeque<(T, u64)>,
    size: usize,
    reserve: usize,
}

impl<T> std::fmt::Display for MessageQueue<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MessageQueue({:>2}/{:<2}, reserved={}){:#?}",
            self.inner.len(),
            self.size,
            self.reserve,
            self.inner
                .iter()
                .map(|(value, _)| value.to_string())
                .collect::<Vec<_>>()
        )
    }
}

impl<T> MessageQueue<T> {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(size),
            size,
            reserve: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter().map(|(value, _)| value)
    }

    /// Enqueue a value stamped with the current cycle.
    ///
    /// # Panics
    /// If queued items and reservations already cover the whole queue.
    pub fn enqueue(&mut self, value: T, cycle: u64) {
        assert!(
            self.reserve < self.size,
            "enqueue into a full message queue ({}/{} reserved)",
            self.reserve,
            self.size
        );
        self.inner.push_back((value, cycle));
        self.reserve += 1;
    }

    pub fn dequeue(&mut self) -> Option<T> {
        let (value, _) = self.inner.pop_front()?;
        debug_assert!(self.reserve > 0);
        self.reserve = self.reserve.saturating_sub(1);
        Some(value)
    }

    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.inner.front().map(|(value, _)| value)
    }

    /// Enqueue cycle of the head entry.
    #[must_use]
    pub fn head_timestamp(&self) -> Option<u64> {
        self.inner.front().map(|(_, cycle)| *cycle)
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.full_with(0)
    }

    #[must_use]
    pub fn full_with(&self, extra: usize) -> bool {
        self.reserve + extra >= self.size
    }

    pub fn reserve(&mut self) {
        self.reserve += 1;
    }

    pub fn unreserve(&mut self) {
        assert!(self.reserve > 0, "unreserve of a message queue without reservations");
        self.reserve -= 1;
    }

    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserve
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.reserve = self.reserve.saturating_sub(self.inner.len());
        self.inner.drain(..).map(|(value, _)| value)
    }
}
