//! Firmware-version-dependent pusher state observation.
//!
//! Older microbots (firmware `(0,1,0)`) expose no DeviceStatus register
//! and must have their pusher state inferred from which of the
//! extend/retract characteristics last notified. Newer firmware reports
//! state directly in DeviceStatus. [`FirmwareOverlay`] hides the
//! difference behind one small interface, installed on a [`crate::microbot::Microbot`]
//! once its firmware version is known.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use microbot_types::uuid::{DEVICE_STATUS, EXTEND, PUSH_SERVICE, RETRACT};
use microbot_types::FirmwareVersion;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::reader::SubscribingReader;

/// Version-specific pusher-state logic, selected once per session from
/// the device's reported firmware version.
pub enum FirmwareOverlay {
    V010(FirmwareV010),
    V015(FirmwareV015),
}

impl FirmwareOverlay {
    /// Select the overlay matching `version`. Firmware `(0,1,0)` gets
    /// the legacy overlay; everything else gets the DeviceStatus-based
    /// one.
    pub fn select(version: FirmwareVersion) -> Self {
        if version.is_v010() {
            Self::V010(FirmwareV010::new())
        } else {
            Self::V015(FirmwareV015::new())
        }
    }

    /// Whether the pusher is currently retracted, `None` if unknown.
    pub async fn is_retracted(
        &self,
        conn: &Connection,
        reader: &Arc<SubscribingReader>,
    ) -> Result<Option<bool>> {
        match self {
            Self::V010(v010) => v010.is_retracted(conn).await,
            Self::V015(v015) => v015.is_retracted(conn, reader).await,
        }
    }

    /// Block until the pusher's observed state changes, or `timeout`
    /// elapses.
    pub async fn wait_for_pusher_state_change(
        &self,
        conn: &Connection,
        timeout_duration: Duration,
    ) -> Result<()> {
        match self {
            Self::V010(v010) => v010.wait_for_pusher_state_change(conn, timeout_duration).await,
            Self::V015(v015) => v015.wait_for_pusher_state_change(conn, timeout_duration).await,
        }
    }
}

/// Overlay for firmware `(0,1,0)`: infers pusher state from which of
/// the extend/retract characteristics last fired, since this firmware
/// has no DeviceStatus register.
pub struct FirmwareV010 {
    state: watch::Sender<bool>,
    init_lock: Mutex<()>,
    initialized: AtomicBool,
}

impl FirmwareV010 {
    fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            state,
            init_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Subscribes to the extend/retract characteristics on first call,
    /// forces a retract so the starting state is known, and returns the
    /// last-observed state thereafter.
    async fn is_retracted(&self, conn: &Connection) -> Result<Option<bool>> {
        if !self.initialized.load(Ordering::SeqCst) {
            let _guard = self.init_lock.lock().await;
            if !self.initialized.load(Ordering::SeqCst) {
                let extend_tx = self.state.clone();
                conn.on_notify(PUSH_SERVICE, EXTEND, move |_data| {
                    debug!("pusher extended (legacy firmware)");
                    let _ = extend_tx.send(false);
                })
                .await?;

                let retract_tx = self.state.clone();
                conn.on_notify(PUSH_SERVICE, RETRACT, move |_data| {
                    debug!("pusher retracted (legacy firmware)");
                    let _ = retract_tx.send(true);
                })
                .await?;

                conn.write(PUSH_SERVICE, RETRACT, &[0x01]).await?;
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.initialized.store(true, Ordering::SeqCst);
            }
        }
        Ok(Some(*self.state.borrow()))
    }

    async fn wait_for_pusher_state_change(&self, conn: &Connection, timeout_duration: Duration) -> Result<()> {
        self.is_retracted(conn).await?;
        let mut rx = self.state.subscribe();
        match timeout(timeout_duration, rx.changed()).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::StateChangeError(timeout_duration)),
        }
    }
}

/// Overlay for all firmware other than `(0,1,0)`: reads pusher state
/// directly from the DeviceStatus characteristic.
pub struct FirmwareV015;

impl FirmwareV015 {
    fn new() -> Self {
        Self
    }

    async fn is_retracted(
        &self,
        conn: &Connection,
        reader: &Arc<SubscribingReader>,
    ) -> Result<Option<bool>> {
        let status = reader.read(conn, PUSH_SERVICE, DEVICE_STATUS).await?;
        Ok(status.get(1).map(|byte| *byte == 0x00))
    }

    async fn wait_for_pusher_state_change(&self, conn: &Connection, timeout_duration: Duration) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let handle = conn
            .on_notify(PUSH_SERVICE, DEVICE_STATUS, move |_data| {
                let _ = tx.send(());
            })
            .await?;

        let result = timeout(timeout_duration, rx.recv()).await;
        handle.cancel();

        match result {
            Ok(Some(())) => Ok(()),
            _ => Err(Error::StateChangeError(timeout_duration)),
        }
    }
}
