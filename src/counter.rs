use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter that is safe to bump and read from any thread
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, by: u64) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Message and byte totals of one worker
#[derive(Debug, Default)]
pub struct Throughput {
    messages: Counter,
    bytes: Counter,
}

impl Throughput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one message of `len` bytes
    pub fn record(&self, len: usize) {
        self.messages.increment(1);
        self.bytes.increment(len as u64);
    }

    pub fn messages(&self) -> u64 {
        self.messages.snapshot()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments() {
        let throughput = Arc::new(Throughput::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throughput = Arc::clone(&throughput);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        throughput.record(16);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(throughput.messages(), 8000);
        assert_eq!(throughput.bytes(), 8000 * 16);
    }
}
