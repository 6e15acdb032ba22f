// =============================================================================
// BarStream — appendable blocking queue feeding the strategy
// =============================================================================
//
// The strategy consumes bars as a forward sequence that can be extended at
// the tail and have its last element replaced while a run is in flight. The
// consumer blocks on an empty queue until `append` or `finish`; `finish` is
// the completion signal — a drained, finished stream yields `None`.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::bar::Bar;

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Bar>,
    finished: bool,
}

/// Thread-safe appendable bar queue. Producers (the runner's event handler)
/// and the consumer (the strategy-step worker) share it through `Arc`.
#[derive(Debug, Default)]
pub struct BarStream {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl BarStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stream preloaded with `bars`.
    pub fn prefilled(bars: impl IntoIterator<Item = Bar>) -> Self {
        let stream = Self::new();
        {
            let mut inner = stream.inner.lock();
            inner.queue.extend(bars);
        }
        stream
    }

    /// Append one bar at the tail and wake the consumer.
    pub fn append(&self, bar: Bar) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(bar);
        self.cv.notify_one();
    }

    /// Replace the last queued bar in place. Returns false when the queue is
    /// empty (nothing to replace).
    pub fn replace_last(&self, bar: Bar) -> bool {
        let mut inner = self.inner.lock();
        match inner.queue.back_mut() {
            Some(last) => {
                *last = bar;
                self.cv.notify_one();
                true
            }
            None => false,
        }
    }

    /// Signal completion: the consumer drains what remains and then stops.
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finished = true;
        self.cv.notify_all();
    }

    /// Pop the next bar, blocking while the queue is empty and unfinished.
    /// Returns `None` once the stream is finished and drained.
    pub fn next(&self) -> Option<Bar> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(bar) = inner.queue.pop_front() {
                return Some(bar);
            }
            if inner.finished {
                return None;
            }
            self.cv.wait(&mut inner);
        }
    }

    /// Number of queued (unconsumed) bars.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn bar(ts: i64) -> Bar {
        Bar::new(ts, 1.0, 2.0, 0.5, 1.5, 3.0)
    }

    #[test]
    fn prefilled_drains_in_order() {
        let stream = BarStream::prefilled([bar(1), bar(2), bar(3)]);
        stream.finish();
        assert_eq!(stream.next().unwrap().ts, 1);
        assert_eq!(stream.next().unwrap().ts, 2);
        assert_eq!(stream.next().unwrap().ts, 3);
        assert!(stream.next().is_none());
    }

    #[test]
    fn replace_last_swaps_tail() {
        let stream = BarStream::prefilled([bar(1), bar(2)]);
        assert!(stream.replace_last(bar(99)));
        stream.finish();
        assert_eq!(stream.next().unwrap().ts, 1);
        assert_eq!(stream.next().unwrap().ts, 99);
    }

    #[test]
    fn replace_last_on_empty_is_false() {
        let stream = BarStream::new();
        assert!(!stream.replace_last(bar(1)));
    }

    #[test]
    fn consumer_blocks_until_append() {
        let stream = Arc::new(BarStream::new());
        let consumer_stream = stream.clone();

        let consumer = std::thread::spawn(move || consumer_stream.next());

        // Give the consumer a moment to park on the condvar.
        std::thread::sleep(Duration::from_millis(50));
        stream.append(bar(7));

        let got = consumer.join().unwrap();
        assert_eq!(got.unwrap().ts, 7);
    }

    #[test]
    fn finish_wakes_blocked_consumer() {
        let stream = Arc::new(BarStream::new());
        let consumer_stream = stream.clone();

        let consumer = std::thread::spawn(move || consumer_stream.next());
        std::thread::sleep(Duration::from_millis(50));
        stream.finish();

        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn append_after_prefill_extends_tail() {
        let stream = BarStream::prefilled([bar(1)]);
        stream.append(bar(2));
        stream.finish();
        assert_eq!(stream.next().unwrap().ts, 1);
        assert_eq!(stream.next().unwrap().ts, 2);
        assert!(stream.next().is_none());
    }
}
