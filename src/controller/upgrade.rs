//! Upgrade gate implementations

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::domain::{UpgradeGate, UpgradeSignal};
use crate::error::Result;

/// Logs every published signal
#[derive(Debug, Clone, Default)]
pub struct LoggingUpgradeGate;

#[async_trait]
impl UpgradeGate for LoggingUpgradeGate {
    async fn publish(&self, signal: &UpgradeSignal) -> Result<()> {
        info!(
            upgradeable = signal.upgradeable,
            reason = %signal.reason,
            "Upgrade gate: {}",
            signal.message
        );
        Ok(())
    }
}

/// Keeps every published signal
#[derive(Debug, Default)]
pub struct RecordingUpgradeGate {
    signals: Mutex<Vec<UpgradeSignal>>,
}

impl RecordingUpgradeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<UpgradeSignal> {
        self.signals.lock().clone()
    }

    pub fn last(&self) -> Option<UpgradeSignal> {
        self.signals.lock().last().cloned()
    }
}

#[async_trait]
impl UpgradeGate for RecordingUpgradeGate {
    async fn publish(&self, signal: &UpgradeSignal) -> Result<()> {
        self.signals.lock().push(signal.clone());
        Ok(())
    }
}
