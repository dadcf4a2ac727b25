//! Automatic sweep producer.
//!
//! One task per sweep: every tick it takes the next trajectory point, hands
//! it to the arbiter as a one-tick hold and mirrors it to a bounded channel
//! that the transport drains. A subscriber that does not keep up loses
//! points; it never stalls the arbiter feed.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use turret_core::{MotionRequest, MotionSource, SweepConfig, SweepTrajectory};

use crate::arbiter::Arbiter;

pub const SWEEP_CHANNEL_SIZE: usize = 16;

/// One emitted sweep sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPoint {
    /// Same as `pan`; kept for older `/control` clients
    pub angle: f64,
    pub pan: f64,
    pub tilt: f64,
    /// Seconds since the sweep started
    pub t: f64,
}

/// Run the sweep until `cancel` fires or the receiving side of `tx` is gone
pub async fn run_sweep(
    arbiter: Arbiter,
    config: SweepConfig,
    tx: mpsc::Sender<SweepPoint>,
    cancel: CancellationToken,
) {
    let tick = config.tick.max(std::time::Duration::from_millis(1));
    let mut trajectory = SweepTrajectory::new(config);
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut dropped: u64 = 0;

    log::info!(
        "Sweep started: amplitude {} ω {} φ {} tick {:?}",
        config.effective_amplitude(),
        config.angular_frequency,
        config.phase,
        tick
    );

    loop {
        tokio::select! { biased;
            _ = cancel.cancelled() => {
                log::debug!("Sweep cancelled");
                break;
            }
            _ = tx.closed() => {
                log::debug!("Sweep subscriber went away");
                break;
            }
            _ = ticker.tick() => {}
        }

        let t = trajectory.elapsed();
        let Some(target) = trajectory.next() else {
            break;
        };
        arbiter.request_motion(MotionRequest::new(target, tick, MotionSource::AutoSweep));

        let point = SweepPoint {
            angle: target.pan(),
            pan: target.pan(),
            tilt: target.tilt(),
            t,
        };
        match timeout(tick, tx.send(point)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                dropped += 1;
                log::trace!("Sweep subscriber is slow, dropped point at t={:.2}", t);
            }
        }
    }

    if dropped > 0 {
        log::debug!("Sweep dropped {} points for a slow subscriber", dropped);
    }
    log::info!("Sweep stopped after {:.1}s", trajectory.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use turret_core::{HoldPolicy, SimulatedActuator};

    fn setup() -> (Arbiter, SimulatedActuator, SweepConfig) {
        let sim = SimulatedActuator::new();
        let arbiter = Arbiter::new(
            Box::new(sim.clone()),
            HoldPolicy {
                reassert_interval: Duration::from_millis(10),
                fault_threshold: 3,
            },
        );
        let config = SweepConfig {
            tick: Duration::from_millis(10),
            angular_frequency: 5.0,
            ..SweepConfig::default()
        };
        (arbiter, sim, config)
    }

    #[tokio::test]
    async fn test_sweep_feeds_arbiter_and_stream() {
        let (arbiter, sim, config) = setup();
        let (tx, mut rx) = mpsc::channel(SWEEP_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweep(arbiter.clone(), config, tx, cancel.clone()));

        let mut points = Vec::new();
        while points.len() < 10 {
            points.push(rx.recv().await.unwrap());
        }
        assert_eq!(points[0].pan, 0.0);
        assert_eq!(points[0].angle, points[0].pan);
        assert!(points.windows(2).all(|w| w[1].t > w[0].t));
        assert!(points
            .windows(2)
            .all(|w| (w[1].pan - w[0].pan).abs() <= config.max_step() + 1e-9));
        assert!(sim.command_count() >= 5);

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .unwrap()
            .unwrap();

        // No further sweep requests once stopped
        tokio::time::sleep(Duration::from_millis(40)).await;
        let count = sim.command_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sim.command_count(), count);
    }

    #[tokio::test]
    async fn test_sweep_stops_when_receiver_dropped() {
        let (arbiter, _sim, config) = setup();
        let (tx, rx) = mpsc::channel(SWEEP_CHANNEL_SIZE);
        let task = tokio::spawn(run_sweep(arbiter, config, tx, CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(rx);
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_stall() {
        let (arbiter, sim, config) = setup();
        // Never drained
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        tokio::spawn(run_sweep(arbiter, config, tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Arbiter keeps receiving targets even though the stream is full
        let targets: std::collections::HashSet<u64> = sim
            .commands()
            .iter()
            .map(|p| p.pan().to_bits())
            .collect();
        assert!(targets.len() >= 3);
        cancel.cancel();
    }
}
