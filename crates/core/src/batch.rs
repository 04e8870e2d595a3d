//! Per-client batching of parsed observations before they hit the database.
//!
//! A batch flushes when it reaches `capacity` items, or when its oldest
//! pending item is older than `max_age` — whichever comes first. The
//! supervisor polls `should_flush`/`take` on a short tick; this type itself
//! does no timer-driving of its own.

use std::time::{Duration, Instant};

use crate::message::ResolvedObservation;

pub struct BatchBuffer {
    items: Vec<ResolvedObservation>,
    capacity: usize,
    max_age: Duration,
    oldest: Option<Instant>,
}

impl BatchBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            max_age,
            oldest: None,
        }
    }

    pub fn push(&mut self, obs: ResolvedObservation) {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.items.push(obs);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn should_flush(&self) -> bool {
        if self.items.is_empty() {
            return false;
        }
        if self.items.len() >= self.capacity {
            return true;
        }
        matches!(self.oldest, Some(t) if t.elapsed() >= self.max_age)
    }

    /// Drain the buffer, resetting its age clock.
    pub fn take(&mut self) -> Vec<ResolvedObservation> {
        self.oldest = None;
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResolvedObservation;

    fn sample() -> ResolvedObservation {
        ResolvedObservation {
            message_id: "msg-1".into(),
            station_id: 1,
            dataset_id: 1,
            data_id: None,
            publish_datetime: "2026-07-28T00:00:00Z".into(),
            observation_datetime: "2026-07-28T00:00:00Z".into(),
            canonical_link: None,
            raw_json: "{}".into(),
        }
    }

    #[test]
    fn flushes_on_capacity() {
        let mut buf = BatchBuffer::new(2, Duration::from_secs(60));
        buf.push(sample());
        assert!(!buf.should_flush());
        buf.push(sample());
        assert!(buf.should_flush());
        let drained = buf.take();
        assert_eq!(drained.len(), 2);
        assert!(buf.is_empty());
        assert!(!buf.should_flush());
    }

    #[test]
    fn flushes_on_age() {
        let mut buf = BatchBuffer::new(50, Duration::from_millis(1));
        buf.push(sample());
        std::thread::sleep(Duration::from_millis(5));
        assert!(buf.should_flush());
    }

    #[test]
    fn empty_buffer_never_flushes() {
        let buf = BatchBuffer::new(50, Duration::from_secs(5));
        assert!(!buf.should_flush());
    }
}
