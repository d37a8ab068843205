//! Delay imports while the host is busy

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::LoadCheckConfig;

/// Source of the current system load
pub trait LoadProbe: Send + Sync {
    /// 1-minute load average
    fn load_average(&self) -> std::io::Result<f64>;
}

/// Reads `/proc/loadavg`
#[derive(Debug, Clone)]
pub struct ProcLoadAverage {
    path: PathBuf,
}

impl Default for ProcLoadAverage {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/loadavg"),
        }
    }
}

impl ProcLoadAverage {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LoadProbe for ProcLoadAverage {
    fn load_average(&self) -> std::io::Result<f64> {
        let content = std::fs::read_to_string(&self.path)?;
        parse_loadavg(&content).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected content in {}", self.path.display()),
            )
        })
    }
}

/// First field of a `/proc/loadavg` line
pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

pub struct LoadCheck {
    config: LoadCheckConfig,
    probe: Arc<dyn LoadProbe>,
}

impl LoadCheck {
    pub fn new(config: LoadCheckConfig, probe: Arc<dyn LoadProbe>) -> Self {
        Self { config, probe }
    }

    /// Wait while the load exceeds the threshold, at most `max_delays` times
    ///
    /// Proceeds regardless once the delays are used up. `on_delay` receives the delay
    /// number and the observed load before each wait. Returns the number of delays taken.
    pub async fn wait_for_capacity(&self, mut on_delay: impl FnMut(u32, f64)) -> u32 {
        if !self.config.enabled {
            return 0;
        }

        let mut delays = 0;
        while delays < self.config.max_delays {
            let load = match self.probe.load_average() {
                Ok(load) => load,
                Err(e) => {
                    warn!(error = %e, "Cannot read system load, not delaying");
                    return delays;
                },
            };
            if load <= self.config.threshold {
                debug!(load, threshold = self.config.threshold, "System load acceptable");
                return delays;
            }

            delays += 1;
            on_delay(delays, load);
            tokio::time::sleep(self.config.delay()).await;
        }
        delays
    }
}
