//! Auto-reconnecting proxy in front of a [`Connection`].
//!
//! `StableConnection` does not know how to establish a connection
//! itself — the owning session supplies a [`Reconnector`] closure that
//! re-runs the authenticated-connect procedure, and a [`ReconnectHook`]
//! that re-subscribes cached reads once the new connection is up.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Maximum reconnection attempts before the stable connection gives up
/// and goes permanently inactive.
pub const MAX_RETRIES: u32 = 5;

/// Re-establishes and re-authenticates a fresh [`Connection`].
pub type Reconnector = Box<dyn Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

/// Invoked with the freshly reconnected connection so the caller can
/// re-subscribe any notify-backed caches.
pub type ReconnectHook = Box<dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Auto-reconnecting wrapper around [`Connection`].
///
/// Once `max_retries` consecutive reconnection attempts fail, the
/// stable connection goes permanently inactive and every subsequent
/// `get()` fails immediately without retrying again.
pub struct StableConnection {
    conn: Mutex<Option<Arc<Connection>>>,
    active: std::sync::atomic::AtomicBool,
    max_retries: u32,
    reconnector: Reconnector,
    on_reconnect: ReconnectHook,
}

impl StableConnection {
    /// Wrap an already-established connection.
    pub fn new(conn: Connection, reconnector: Reconnector, on_reconnect: ReconnectHook) -> Self {
        Self {
            conn: Mutex::new(Some(Arc::new(conn))),
            active: std::sync::atomic::AtomicBool::new(true),
            max_retries: MAX_RETRIES,
            reconnector,
            on_reconnect,
        }
    }

    /// Return the live connection, reconnecting first if the
    /// underlying link has dropped.
    pub async fn get(&self) -> Result<Arc<Connection>> {
        if !self.active.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::ConnectionError("connection closed".into()));
        }

        let mut guard = self.conn.lock().await;
        let needs_reconnect = match guard.as_ref() {
            Some(conn) => !conn.is_active(),
            None => true,
        };

        if needs_reconnect {
            let mut retry = 0;
            let mut last_err = None;
            while retry < self.max_retries {
                sleep(Duration::from_secs(retry as u64)).await;
                match (self.reconnector)().await {
                    Ok(new_conn) => {
                        let new_conn = Arc::new(new_conn);
                        *guard = Some(Arc::clone(&new_conn));
                        info!(attempt = retry + 1, "reconnected");
                        if let Err(err) = (self.on_reconnect)(Arc::clone(&new_conn)).await {
                            warn!(error = %err, "post-reconnect hook failed");
                        }
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!(attempt = retry + 1, error = %err, "reconnect attempt failed");
                        last_err = Some(err);
                        retry += 1;
                    }
                }
            }

            if last_err.is_some() || !matches!(guard.as_ref(), Some(c) if c.is_active()) {
                self.active.store(false, std::sync::atomic::Ordering::SeqCst);
                *guard = None;
                return Err(Error::ConnectionError("connection failed".into()));
            }
        }

        Ok(Arc::clone(guard.as_ref().expect("connection present after reconnect check")))
    }

    /// Whether this stable connection is still usable. A `false` here
    /// means `get()` will always fail until a new `StableConnection` is
    /// created.
    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Permanently close the underlying connection and mark this
    /// stable connection inactive.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close().await?;
        }
        self.active.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRawConnection, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn mock_transport() -> Arc<dyn crate::transport::Transport> {
        Arc::new(MockTransport::new([0; 6]))
    }

    fn connected_mock() -> Connection {
        Connection::new(mock_transport(), Box::new(MockRawConnection::new()))
    }

    #[tokio::test]
    async fn get_returns_inner_connection_without_reconnecting_when_active() {
        let stable = StableConnection::new(
            connected_mock(),
            Box::new(|| Box::pin(async { Ok(connected_mock()) })),
            Box::new(|_conn| Box::pin(async { Ok(()) })),
        );

        let conn = stable.get().await.unwrap();
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn get_reconnects_and_runs_hook_when_inner_connection_dropped() {
        let dropped = connected_mock();
        let raw = MockRawConnection::new();
        raw.simulate_disconnect();
        // force the initial connection inactive by boxing a disconnected mock
        let initial = Connection::new(mock_transport(), Box::new(raw));
        let _ = dropped;

        let hook_ran = Arc::new(AtomicU32::new(0));
        let hook_ran_clone = Arc::clone(&hook_ran);

        let stable = StableConnection::new(
            initial,
            Box::new(|| Box::pin(async { Ok(connected_mock()) })),
            Box::new(move |_conn| {
                hook_ran_clone.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }),
        );

        let conn = stable.get().await.unwrap();
        assert!(conn.is_active());
        assert_eq!(hook_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_marks_permanently_inactive_after_exhausting_retries() {
        let raw = MockRawConnection::new();
        raw.simulate_disconnect();
        let initial = Connection::new(mock_transport(), Box::new(raw));

        let stable = StableConnection::new(
            initial,
            Box::new(|| Box::pin(async { Err(Error::ConnectionError("no route".into())) })),
            Box::new(|_conn| Box::pin(async { Ok(()) })),
        );

        let err = stable.get().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
        assert!(!stable.is_active());

        // A second call fails immediately without retrying again.
        let err2 = stable.get().await.unwrap_err();
        assert!(matches!(err2, Error::ConnectionError(_)));
    }
}
