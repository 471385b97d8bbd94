use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::io::JsonFile;
use crate::device::types::SessionView;
use crate::error::ConfigError;

/// The latest weight seen from the scale, for features that run while it is not connected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightRecord {
    pub weight: f64,
    /// Milliseconds since the unix epoch, 0 if nothing has been recorded yet.
    pub timestamp_ms: u64,
}

impl WeightRecord {
    pub fn now(weight: f64) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);

        WeightRecord { weight, timestamp_ms }
    }

    pub fn recorded_at(&self) -> Option<SystemTime> {
        if self.timestamp_ms == 0 {
            return None;
        }
        Some(UNIX_EPOCH + std::time::Duration::from_millis(self.timestamp_ms))
    }
}

#[derive(Clone)]
pub struct WeightStore {
    file: JsonFile,
}

impl WeightStore {
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        Ok(WeightStore { file: JsonFile::open(path)? })
    }

    pub async fn save_weight(&self, weight: f64) -> Result<(), ConfigError> {
        self.file.save(&WeightRecord::now(weight)).await
    }

    pub async fn latest(&self) -> Result<WeightRecord, ConfigError> {
        self.file.read().await
    }

    pub async fn latest_weight(&self) -> Result<f64, ConfigError> {
        Ok(self.latest().await?.weight)
    }
}

/// Saves the weight of every new reading the session publishes.
pub fn record_weights(cancel: CancellationToken, store: WeightStore, mut view: watch::Receiver<SessionView>) -> JoinHandle<()> {
    spawn(async move {
        let mut previous_frame: Option<String> = None;

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                changed = view.changed() => {
                    if changed.is_err() {
                        // the session is gone
                        break 'mainloop;
                    }

                    let reading = view.borrow_and_update().reading.clone();
                    let reading = match reading {
                        Some(reading) => reading,
                        None => {
                            // a new connection records its first frame even if it repeats the last one
                            previous_frame = None;
                            continue;
                        },
                    };

                    // views also change for log lines and state, only store readings once
                    let frame = Some(reading.raw_frame.clone());
                    if frame == previous_frame {
                        continue;
                    }
                    previous_frame = frame;

                    debug!("Recording weight {:.1}g", reading.weight);
                    if let Err(err) = store.save_weight(f64::from(reading.weight)).await {
                        warn!("Failed to record weight: {}", err);
                    }
                },
            }
        }
    })
}
