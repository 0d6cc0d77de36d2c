//! Periodic monitor polling.

use super::queue::TaskSender;
use super::task::Task;
use crate::error::AppResult;
use crate::hardware::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Enqueues one MONITOR task per ready port on a fixed interval.
///
/// The ticker only produces tasks; it never touches a device.
pub struct MonitorTicker {
    registry: Arc<DeviceRegistry>,
    sender: TaskSender,
    period: Duration,
}

impl MonitorTicker {
    /// Create a ticker.
    pub fn new(registry: Arc<DeviceRegistry>, sender: TaskSender, period: Duration) -> Self {
        Self {
            registry,
            sender,
            period,
        }
    }

    /// Enqueue one monitor round. Returns the number of tasks enqueued.
    ///
    /// # Errors
    /// [`HvError::QueueClosed`](crate::error::HvError::QueueClosed) once the
    /// worker is gone.
    pub fn tick_once(&self) -> AppResult<usize> {
        let ports = self.registry.ready_ports();
        if ports.is_empty() {
            warn!("No ready ports to monitor");
            return Ok(0);
        }

        for &port_id in &ports {
            self.sender.enqueue(Task::monitor(port_id))?;
        }
        debug!(count = ports.len(), "Monitor round enqueued");
        Ok(ports.len())
    }

    /// Tick until the queue closes.
    pub async fn run(self) -> AppResult<()> {
        info!(period = ?self.period, "Monitor ticker started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once() {
                info!("Monitor ticker stopping: {}", e);
                return Err(e);
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(self) -> JoinHandle<AppResult<()>> {
        tokio::spawn(self.run())
    }
}
