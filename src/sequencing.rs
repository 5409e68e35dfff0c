#![forbid(unsafe_code)]

// Sequencing - timed value sequences for smooth effect parameter transitions

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A finite, lazily produced sequence of values between two floats.
///
/// Emits `ceil(duration / step)` samples (at least one) at roughly `step`
/// spacing, the last of which equals the target value. The sequence is
/// single-consumer and not restartable; `stop` promptly ends it.
pub struct LinearInterpolator {
    rx: mpsc::Receiver<f32>,
    stop: CancellationToken,
}

impl LinearInterpolator {
    pub fn new(from: f32, to: f32, duration_ms: u64, step_ms: u64) -> Self {
        let step_ms = step_ms.max(1);
        let steps = (duration_ms.div_ceil(step_ms)).max(1);
        // Capacity 1 keeps production lazy: the producer runs at most one step
        // ahead of the consumer.
        let (tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        let worker_stop = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(step_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately
            interval.tick().await;

            for i in 1..=steps {
                tokio::select! {
                    _ = worker_stop.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let value = from + (to - from) * (i as f32) / (steps as f32);
                tokio::select! {
                    _ = worker_stop.cancelled() => return,
                    sent = tx.send(value) => {
                        if sent.is_err() {
                            // Consumer dropped the sequence
                            return;
                        }
                    }
                }
            }
        });

        Self { rx, stop }
    }

    /// Receives the next value, or `None` once the sequence has terminated.
    pub async fn next(&mut self) -> Option<f32> {
        self.rx.recv().await
    }

    /// Terminates the sequence early. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A handle that can stop this interpolator after it has been handed to
    /// its consumer.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut interpolator: LinearInterpolator) -> Vec<f32> {
        let mut values = Vec::new();
        while let Some(v) = interpolator.next().await {
            values.push(v);
        }
        values
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_ceil_duration_over_step_values() {
        let values = collect(LinearInterpolator::new(0.0, 1.0, 300, 30)).await;
        assert_eq!(values.len(), 10);

        // 100 / 30 rounds up
        let values = collect(LinearInterpolator::new(0.0, 1.0, 100, 30)).await;
        assert_eq!(values.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_value_is_target() {
        let values = collect(LinearInterpolator::new(2.0, 5.0, 150, 30)).await;
        assert_eq!(*values.last().unwrap(), 5.0);
        // Monotonic ascent
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_emits_single_sample() {
        let values = collect(LinearInterpolator::new(0.0, 1.0, 0, 30)).await;
        assert_eq!(values, vec![1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_terminates_promptly() {
        let mut interpolator = LinearInterpolator::new(0.0, 1.0, 10_000, 30);
        assert!(interpolator.next().await.is_some());

        interpolator.stop();
        // stop twice is fine
        interpolator.stop();

        let remaining = tokio::time::timeout(Duration::from_millis(100), async {
            let mut n = 0;
            while interpolator.next().await.is_some() {
                n += 1;
            }
            n
        })
        .await
        .expect("sequence should close promptly after stop");
        // At most the single in-flight value survives a stop
        assert!(remaining <= 1);
    }
}
