//! Rotation scheduler: a jittered clock that asks for address rotations.
//!
//! The scheduler owns no mapping state. It emits a [`RotationTick`] right
//! away (so hosts get virtual addresses before traffic flows), then sleeps
//! for a random duration in `[min, max]` before each further tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A request to rotate, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationTick {
    pub seq: u64,
}

pub struct RotationScheduler {
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl RotationScheduler {
    /// `min` must not exceed `max` (enforced by config validation).
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    pub fn with_rng(min: Duration, max: Duration, rng: StdRng) -> Self {
        RotationScheduler { min, max, rng }
    }

    /// Next sleep, uniformly drawn from `[min, max]`.
    pub fn next_delay(&mut self) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        self.rng.gen_range(self.min..=self.max)
    }

    /// Run on the current task until the receiver goes away.
    pub async fn run(mut self, ticks: mpsc::Sender<RotationTick>) {
        let mut seq = 0u64;
        loop {
            seq += 1;
            if ticks.send(RotationTick { seq }).await.is_err() {
                info!("Rotation receiver closed, scheduler stopping");
                return;
            }
            let delay = self.next_delay();
            debug!(seq, delay_ms = delay.as_millis() as u64, "Next rotation scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    pub fn spawn(self, ticks: mpsc::Sender<RotationTick>) -> JoinHandle<()> {
        tokio::spawn(self.run(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds() {
        let min = Duration::from_secs(10);
        let max = Duration::from_secs(30);
        let mut scheduler = RotationScheduler::with_rng(min, max, StdRng::seed_from_u64(3));

        let delays: Vec<_> = (0..1000).map(|_| scheduler.next_delay()).collect();
        assert!(delays.iter().all(|d| *d >= min && *d <= max));
        // Jitter: not all the same
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_fixed_interval() {
        let d = Duration::from_secs(5);
        let mut scheduler = RotationScheduler::with_rng(d, d, StdRng::seed_from_u64(3));
        assert_eq!(scheduler.next_delay(), d);
    }

    #[tokio::test]
    async fn test_first_tick_is_immediate() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = RotationScheduler::new(Duration::from_secs(3600), Duration::from_secs(7200))
            .spawn(tx);

        let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick, RotationTick { seq: 1 });
        handle.abort();
    }

    #[tokio::test]
    async fn test_ticks_repeat_and_stop_when_receiver_dropped() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = RotationScheduler::new(Duration::from_millis(1), Duration::from_millis(5))
            .spawn(tx);

        for expected in 1..=3 {
            let tick = rx.recv().await.unwrap();
            assert_eq!(tick.seq, expected);
        }
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
