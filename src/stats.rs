//! Process-wide probe counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::http_probe::result::ErrorType;

#[derive(Debug, Default)]
pub struct ProbeStats {
    started: AtomicU64,
    up: AtomicU64,
    io_errors: AtomicU64,
    validation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started: u64,
    pub up: u64,
    pub io_errors: u64,
    pub validation_failures: u64,
}

impl ProbeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_finished(&self, error: Option<ErrorType>) {
        let counter = match error {
            None => &self.up,
            Some(ErrorType::Io) => &self.io_errors,
            Some(ErrorType::Validate) => &self.validation_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            up: self.up.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn concurrent_updates_are_counted() {
        let stats = Arc::new(ProbeStats::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                stats.probe_started();
                let outcome = match i % 4 {
                    0 => Some(ErrorType::Io),
                    1 => Some(ErrorType::Validate),
                    _ => None,
                };
                stats.probe_finished(outcome);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                started: 32,
                up: 16,
                io_errors: 8,
                validation_failures: 8,
            }
        );
    }
}
