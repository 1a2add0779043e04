//! Outbound state-change notification transport.

use crate::error::{Result, WardenError};
use crate::types::{CallbackRoute, OpaqueToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

/// Payload delivered to a registered client after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeNotification {
    /// Name of the restarted server.
    pub server_name: String,
    /// Name the client registered to monitor.
    pub monitor_target: String,
    /// New server epoch.
    pub epoch: u64,
    /// Token supplied at registration, returned unchanged.
    pub token: OpaqueToken,
    /// Callback routing supplied at registration.
    pub route: CallbackRoute,
}

/// Acknowledgment returned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAck {
    pub accepted: bool,
    pub epoch: u64,
}

impl NotificationAck {
    /// Check the ack against the notification it answers.
    pub fn verify(&self, notification: &StateChangeNotification) -> Result<()> {
        if !self.accepted {
            return Err(WardenError::ConnectionFailed("Notification refused by client".into()));
        }
        if self.epoch != notification.epoch {
            return Err(WardenError::MalformedAck(format!(
                "Ack echoes epoch {}, expected {}",
                self.epoch, notification.epoch
            )));
        }
        Ok(())
    }
}

/// Transport for delivering notifications to client callback addresses.
#[async_trait::async_trait]
pub trait CallbackTransport: Send + Sync {
    /// Deliver one notification and wait for its acknowledgment.
    async fn send_notification(
        &self,
        address: &str,
        notification: &StateChangeNotification,
        timeout: Duration,
    ) -> Result<()>;
}

/// TCP transport: one fresh connection per notification.
///
/// Sends the notification as a single JSON line and reads a single JSON
/// line [`NotificationAck`] back.
#[derive(Debug, Default, Clone)]
pub struct TcpCallbackTransport;

impl TcpCallbackTransport {
    /// Create a new transport.
    pub fn new() -> Self {
        Self
    }

    async fn exchange(address: &str, notification: &StateChangeNotification) -> Result<()> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| WardenError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_vec(notification)?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| WardenError::ConnectionFailed(format!("{}: {}", address, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| WardenError::ConnectionFailed(format!("{}: {}", address, e)))?;

        let mut reply = String::new();
        let n = BufReader::new(reader)
            .read_line(&mut reply)
            .await
            .map_err(|e| WardenError::ConnectionFailed(format!("{}: {}", address, e)))?;
        if n == 0 {
            return Err(WardenError::MalformedAck(format!(
                "{} closed the connection without acknowledging",
                address
            )));
        }

        let ack: NotificationAck = serde_json::from_str(reply.trim())
            .map_err(|e| WardenError::MalformedAck(format!("{}: {}", address, e)))?;
        trace!(address, epoch = ack.epoch, "Received notification ack");
        ack.verify(notification)
    }
}

#[async_trait::async_trait]
impl CallbackTransport for TcpCallbackTransport {
    async fn send_notification(
        &self,
        address: &str,
        notification: &StateChangeNotification,
        timeout: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(timeout, Self::exchange(address, notification)).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::Timeout(timeout.as_millis() as u64)),
        }
    }
}
