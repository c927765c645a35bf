use parking_lot::Mutex;

use crate::metric::Metric;

/// Fixed-capacity circular buffer of metrics with batch checkout.
///
/// A batch checked out via [`MetricBuffer::batch`] is logically removed from
/// the buffer but its slots stay reserved until the caller settles it with
/// [`MetricBuffer::accept`] (written, gone for good) or
/// [`MetricBuffer::reject`] (returned to the head as oldest). At most one
/// batch is outstanding at a time; the per-output flush loop is the only
/// caller.
///
/// When an add overflows the capacity, the oldest datum is overwritten. If
/// the checked-out batch still owns the overwritten slot, the batch shrinks
/// from its head instead; those metrics will not come back on reject.
pub struct MetricBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Vec<Option<Box<dyn Metric>>>,
    /// Index of the first/oldest metric.
    first: usize,
    /// One past the index of the last/newest metric.
    last: usize,
    /// Metrics currently stored, excluding the checked-out batch.
    size: usize,
    cap: usize,
    /// Index of the first metric in the checked-out batch.
    batch_first: usize,
    /// Metrics currently checked out.
    batch_size: usize,
}

impl MetricBuffer {
    /// Creates an empty buffer holding up to `capacity` metrics.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");

        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);

        Self {
            inner: Mutex::new(Inner {
                buf,
                first: 0,
                last: 0,
                size: 0,
                cap: capacity,
                batch_first: 0,
                batch_size: 0,
            }),
        }
    }

    /// Number of metrics currently in the buffer, checked-out batch included.
    pub fn len(&self) -> usize {
        self.inner.lock().length()
    }

    /// Returns true when nothing is buffered or checked out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds one metric, returning how many were dropped to make room.
    pub fn add(&self, metric: Box<dyn Metric>) -> usize {
        self.inner.lock().add_one(metric)
    }

    /// Adds several metrics under one lock, returning the total dropped.
    pub fn add_all(&self, metrics: impl IntoIterator<Item = Box<dyn Metric>>) -> usize {
        let mut inner = self.inner.lock();

        let mut dropped = 0;
        for metric in metrics {
            dropped += inner.add_one(metric);
        }
        dropped
    }

    /// Checks out up to `batch_size` of the oldest metrics, oldest first.
    ///
    /// Returns an empty vec when the buffer has nothing outside an already
    /// outstanding batch. The result must be settled with `accept` or
    /// `reject` before the next checkout.
    pub fn batch(&self, batch_size: usize) -> Vec<Box<dyn Metric>> {
        let mut inner = self.inner.lock();

        let out_len = usize::min(inner.size, batch_size);
        let mut out = Vec::with_capacity(out_len);
        if out_len == 0 {
            return out;
        }

        inner.batch_first = inner.first;
        inner.batch_size = out_len;

        let mut idx = inner.batch_first;
        for _ in 0..out_len {
            let metric = inner.buf[idx]
                .take()
                .expect("live buffer slot must hold a metric");
            out.push(metric);
            idx = inner.next(idx);
        }

        inner.first = inner.next_by(inner.first, out_len);
        inner.size -= out_len;
        out
    }

    /// Marks the checked-out batch as successfully written; the metrics are
    /// permanently removed.
    pub fn accept(&self, batch: Vec<Box<dyn Metric>>) {
        let mut inner = self.inner.lock();

        drop(batch);
        inner.reset_batch();
    }

    /// Returns the checked-out batch to the buffer as its oldest entries.
    ///
    /// If metrics arrived while the batch was out and free space no longer
    /// covers it, the head of the batch is discarded (oldest lost first).
    pub fn reject(&self, batch: Vec<Box<dyn Metric>>) {
        let mut inner = self.inner.lock();

        if batch.is_empty() {
            return;
        }

        let free = inner.cap - inner.size;
        let restore = usize::min(batch.len(), free);
        let skip = batch.len() - restore;

        inner.first = inner.prev_by(inner.first, restore);
        inner.size = usize::min(inner.size + restore, inner.cap);

        let mut idx = inner.first;
        for (i, metric) in batch.into_iter().enumerate() {
            if i < skip {
                continue;
            }
            inner.buf[idx] = Some(metric);
            idx = inner.next(idx);
        }

        inner.reset_batch();
    }
}

impl Inner {
    fn length(&self) -> usize {
        usize::min(self.size + self.batch_size, self.cap)
    }

    fn add_one(&mut self, metric: Box<dyn Metric>) -> usize {
        let mut dropped = 0;
        if self.size == self.cap {
            dropped = 1;

            if self.batch_size > 0 {
                self.batch_size -= 1;
                self.batch_first = self.next(self.batch_first);
            }
        }

        self.buf[self.last] = Some(metric);
        self.last = self.next(self.last);

        if self.size == self.cap {
            self.first = self.next(self.first);
        }

        self.size = usize::min(self.size + 1, self.cap);
        dropped
    }

    /// Next index with wrapping.
    fn next(&self, index: usize) -> usize {
        let index = index + 1;
        if index == self.cap {
            return 0;
        }
        index
    }

    /// Index that is `count` newer, with wrapping.
    fn next_by(&self, index: usize, count: usize) -> usize {
        (index + count) % self.cap
    }

    /// Index that is `count` older, with wrapping. `count` never exceeds the
    /// capacity here.
    fn prev_by(&self, index: usize, count: usize) -> usize {
        (index + self.cap - count % self.cap) % self.cap
    }

    fn reset_batch(&mut self) {
        self.batch_first = 0;
        self.batch_size = 0;
    }
}
