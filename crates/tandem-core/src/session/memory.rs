use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// OS memory-pressure level, fed in by the desktop shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Warning,
    Critical,
}

/// Why the runtime is being asked to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictTrigger {
    /// Periodic scan: only sessions idle past the threshold are eligible.
    Scan,
    /// Pressure signal: every eligible session is evicted immediately.
    Pressure(MemoryPressure),
}

/// Background scanner plus memory-pressure listener.
///
/// The governor only decides *when* to evict; eviction itself runs inside
/// the runtime actor, which owns the session map and re-checks eligibility
/// (current? streaming? still exists?) at execution time.
pub struct MemoryGovernor {
    pressure_tx: mpsc::Sender<MemoryPressure>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MemoryGovernor {
    pub fn spawn(scan_interval: Duration, trigger_tx: mpsc::Sender<EvictTrigger>) -> Self {
        let (pressure_tx, pressure_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_governor(
            scan_interval,
            pressure_rx,
            trigger_tx,
            cancel.clone(),
        ));
        Self {
            pressure_tx,
            cancel,
            task,
        }
    }

    /// Forward an OS memory-pressure notification.
    pub async fn report_pressure(&self, pressure: MemoryPressure) {
        let _ = self.pressure_tx.send(pressure).await;
    }

    /// Sender half of the pressure channel, for wiring into a handle.
    pub fn pressure_sender(&self) -> mpsc::Sender<MemoryPressure> {
        self.pressure_tx.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run_governor(
    scan_interval: Duration,
    mut pressure_rx: mpsc::Receiver<MemoryPressure>,
    trigger_tx: mpsc::Sender<EvictTrigger>,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + scan_interval;
    let mut scan = tokio::time::interval_at(start, scan_interval);
    scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            _ = scan.tick() => {
                debug!("memory scan tick");
                if trigger_tx.send(EvictTrigger::Scan).await.is_err() {
                    break;
                }
            }

            pressure = pressure_rx.recv() => match pressure {
                Some(level) => {
                    info!(?level, "memory pressure signal");
                    if trigger_tx.send(EvictTrigger::Pressure(level)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    debug!("memory governor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pressure_signal_forwards_trigger() {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(8);
        let governor = MemoryGovernor::spawn(Duration::from_secs(3600), trigger_tx);

        governor.report_pressure(MemoryPressure::Critical).await;
        let trigger = trigger_rx.recv().await.unwrap();
        assert_eq!(
            trigger,
            EvictTrigger::Pressure(MemoryPressure::Critical)
        );

        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_scan_fires() {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(8);
        let governor = MemoryGovernor::spawn(Duration::from_millis(20), trigger_tx);

        let trigger = trigger_rx.recv().await.unwrap();
        assert_eq!(trigger, EvictTrigger::Scan);

        governor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(8);
        let governor = MemoryGovernor::spawn(Duration::from_millis(10), trigger_tx);
        governor.shutdown().await;

        // Drain anything sent before shutdown; the channel must then close.
        while trigger_rx.try_recv().is_ok() {}
        assert!(trigger_rx.recv().await.is_none());
    }
}
