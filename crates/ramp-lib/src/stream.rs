//! Append-only sample streams
//!
//! Each stream has exactly one writer (its background producer) and any
//! number of readers. Readers never block on the producer: they take
//! whatever sample is newest at the moment they look.

use crate::models::Timestamped;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

struct Inner<T> {
    samples: RwLock<Vec<Arc<T>>>,
}

/// Create a new stream, returning its single writer and a reader
pub fn sample_stream<T: Timestamped>() -> (SampleWriter<T>, SampleReader<T>) {
    let inner = Arc::new(Inner {
        samples: RwLock::new(Vec::new()),
    });
    (
        SampleWriter {
            inner: inner.clone(),
        },
        SampleReader { inner },
    )
}

/// Write half of a sample stream; deliberately not `Clone`
pub struct SampleWriter<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Timestamped> SampleWriter<T> {
    /// Append a sample
    ///
    /// Returns false (and drops the sample) unless it is strictly newer than
    /// the newest sample already in the stream.
    pub fn push(&self, sample: T) -> bool {
        let mut samples = match self.inner.samples.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(last) = samples.last() {
            if sample.timestamp() <= last.timestamp() {
                warn!(
                    newest = %last.timestamp(),
                    rejected = %sample.timestamp(),
                    "Dropping out-of-order sample"
                );
                return false;
            }
        }

        samples.push(Arc::new(sample));
        true
    }

    /// Get a reader for this stream
    pub fn reader(&self) -> SampleReader<T> {
        SampleReader {
            inner: self.inner.clone(),
        }
    }
}

/// Read half of a sample stream
pub struct SampleReader<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SampleReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Timestamped> SampleReader<T> {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<T>>> {
        match self.inner.samples.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The newest sample, however old
    pub fn latest(&self) -> Option<Arc<T>> {
        self.read().last().cloned()
    }

    /// The newest sample if it is no older than `max_age` at `now`
    pub fn latest_within(&self, max_age: Duration, now: DateTime<Utc>) -> Option<Arc<T>> {
        let latest = self.latest()?;
        // Negative age (sample stamped after `now`) counts as fresh
        match now.signed_duration_since(latest.timestamp()).to_std() {
            Ok(age) if age > max_age => None,
            _ => Some(latest),
        }
    }

    /// Snapshot of every sample taken so far
    pub fn history(&self) -> Vec<Arc<T>> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
