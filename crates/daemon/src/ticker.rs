//! Periodic tick loop, generalizing the teacher's `RefreshScheduler`
//! (`tokio::time::interval` + graceful-stop poll) to any daemon role.

use std::future::Future;
use std::time::Duration;

use log::{error, info};
use tokio::time::interval;

use crate::stop::GracefulStop;

/// Drives a unit of work on a fixed interval until told to stop.
pub struct Ticker {
    interval: Duration,
    stop: GracefulStop,
    name: &'static str,
}

impl Ticker {
    pub fn new(name: &'static str, interval: Duration, stop: GracefulStop) -> Self {
        Ticker { interval, stop, name }
    }

    /// Runs `unit` on every tick until [`GracefulStop::should_stop`] returns
    /// true. `unit` is never interrupted mid-execution; the stop flag is
    /// only consulted between ticks.
    pub async fn run<F, Fut>(&self, mut unit: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        info!("{}: starting with {}-second tick", self.name, self.interval.as_secs());
        let mut ticker = interval(self.interval);

        loop {
            ticker.tick().await;

            if self.stop.should_stop() {
                info!("{}: graceful stop requested, exiting tick loop", self.name);
                return;
            }

            match unit().await {
                Ok(()) => {}
                Err(e) => error!("{}: tick failed: {}", self.name, e),
            }
        }
    }
}
