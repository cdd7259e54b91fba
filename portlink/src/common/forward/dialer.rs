// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CloseError, ForwardedConnection};

/// Dials the same forwarded connection for every address, one exchange at a time behind an exclusive lock
///
/// A forwarded connection carries exactly one data stream, so it can serve
/// only one request/response exchange at a time. Each dial holds the
/// connection exclusively until its guard is dropped; a client which pools or
/// pipelines requests over this dialer will serialize on that lock rather
/// than interleave bytes on the stream.
#[derive(Clone)]
pub struct SingleConnectionDialer {
  connection: Arc<Mutex<ForwardedConnection>>,
}

impl SingleConnectionDialer {
  pub fn new(connection: ForwardedConnection) -> Self {
    Self {
      connection: Arc::new(Mutex::new(connection)),
    }
  }

  /// Waits for exclusive use of the connection; `addr` is ignored
  pub async fn dial(&self, addr: &str) -> OwnedMutexGuard<ForwardedConnection> {
    tracing::trace!(addr, "Dialing forwarded connection");
    Arc::clone(&self.connection).lock_owned().await
  }

  /// As [Self::dial], but fails instead of waiting for an exchange in progress
  pub fn try_dial(&self, addr: &str) -> Option<OwnedMutexGuard<ForwardedConnection>> {
    let guard = Arc::clone(&self.connection).try_lock_owned().ok();
    if guard.is_none() {
      tracing::debug!(addr, "Forwarded connection busy with another exchange");
    }
    guard
  }

  /// Closes the shared connection once no exchange holds it
  pub async fn close(&self) -> Result<(), CloseError> {
    self.connection.lock().await.close().await
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::SingleConnectionDialer;
  use crate::common::{
    forward::{ForwardTarget, Forwarder},
    session::duplex::{self, DuplexUpgrader},
  };

  #[tokio::test]
  async fn every_address_reaches_the_same_connection_one_at_a_time() {
    let (session, mut acceptor) = duplex::pair();
    let forwarder = Forwarder::new(DuplexUpgrader::shared(Arc::new(session)));
    let conn = forwarder
      .forward(&ForwardTarget::new("default", "api-0"), 80)
      .await
      .unwrap();
    let _remote_error = acceptor.next().await.unwrap();
    let mut remote_data = acceptor.next().await.unwrap();
    let dialer = SingleConnectionDialer::new(conn);

    let mut first = dialer.dial("api.example:80").await;
    assert!(dialer.try_dial("other.example:443").is_none());
    first.write_all(b"ping").await.unwrap();
    let request_id = first.request_id();
    drop(first);

    let mut second = dialer.try_dial("other.example:443").unwrap();
    assert_eq!(second.request_id(), request_id);
    let mut received = [0u8; 4];
    remote_data.stream.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"ping");
    remote_data.stream.write_all(b"pong").await.unwrap();
    second.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"pong");
    drop(second);

    dialer.close().await.unwrap();
  }
}
