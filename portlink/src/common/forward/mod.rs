// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Port forwarding over upgraded sessions
//!
//! A [Forwarder] upgrades one session per forwarded connection, opens the
//! error and data sub-streams for it, and hands back a [ForwardedConnection]
//! speaking the conventional connection contract.

use serde::{Deserialize, Serialize};

use crate::{
  common::session::{
    ArcSession, SessionError, SessionUpgrader, StreamHeaders, StreamId, StreamType,
  },
  util::cancellation::CancellationListener,
};

mod connection;
mod dialer;
mod request_id;

pub use connection::{
  poisoning_error, CloseError, CloseFailure, Connection, ForwardAddr, ForwardedConnection,
  NETWORK_NAME,
};
pub use dialer::SingleConnectionDialer;
pub use request_id::{MonotonicRequestIdGenerator, RequestId};

/// The named remote resource a session is upgraded against
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardTarget {
  namespace: String,
  name: String,
}

impl ForwardTarget {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl std::fmt::Display for ForwardTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

/// Port on the target, matched by the remote end; never validated locally
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TargetPort(String);

impl TargetPort {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<u16> for TargetPort {
  fn from(port: u16) -> Self {
    Self(port.to_string())
  }
}

impl From<&str> for TargetPort {
  fn from(port: &str) -> Self {
    Self(port.to_owned())
  }
}

impl From<String> for TargetPort {
  fn from(port: String) -> Self {
    Self(port)
  }
}

impl std::fmt::Display for TargetPort {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
  #[error("error dialing for stream: {0}")]
  Upgrade(#[source] SessionError),
  #[error("error creating {stream_type} stream: {source}")]
  StreamCreation {
    stream_type: StreamType,
    #[source]
    source: SessionError,
  },
  #[error("error returned from remote endpoint: {0}")]
  Remote(String),
  #[error("error while reading error stream: {0}")]
  ErrorStream(#[source] std::io::Error),
  #[error("connection closed")]
  Closed,
}

/// Opens forwarded connections through a reusable upgrade capability
///
/// Each forwarder allocates its own request identifiers, so concurrent
/// forwards through one forwarder never share stream tags.
pub struct Forwarder<U> {
  upgrader: U,
  request_ids: MonotonicRequestIdGenerator,
  cancellation: CancellationListener,
}

impl<U> Forwarder<U>
where
  U: SessionUpgrader,
{
  pub fn new(upgrader: U) -> Self {
    Self::with_cancellation(upgrader, CancellationListener::detached())
  }

  /// Error watchers of every connection stop once `cancellation` fires
  pub fn with_cancellation(upgrader: U, cancellation: CancellationListener) -> Self {
    Self {
      upgrader,
      request_ids: MonotonicRequestIdGenerator::default(),
      cancellation,
    }
  }

  pub fn last_request_id(&self) -> Option<RequestId> {
    self.request_ids.last()
  }

  /// Upgrades a session to `target` and opens a connection to `port` through it
  ///
  /// Any failure aborts the whole attempt; streams opened before the failure
  /// are released and the session is closed before the error is returned.
  #[tracing::instrument(
    level = "debug",
    skip_all,
    fields(target = %target, port = tracing::field::Empty, request_id = tracing::field::Empty),
    err
  )]
  pub async fn forward(
    &self,
    target: &ForwardTarget,
    port: impl Into<TargetPort>,
  ) -> Result<ForwardedConnection, ForwardError> {
    let port = port.into();
    let span = tracing::Span::current();
    span.record("port", &tracing::field::display(&port));

    let session = self
      .upgrader
      .upgrade(target)
      .await
      .map_err(ForwardError::Upgrade)?;

    let request_id = self.request_ids.next();
    span.record("request_id", &request_id.inner());

    let headers = StreamHeaders::new(StreamType::Error, &port, request_id);
    let mut error_stream = match session.open_stream(headers.clone()).await {
      Ok(stream) => stream,
      Err(source) => return Err(abandon(&session, &[], StreamType::Error, source).await),
    };
    // Receive-only; the remote never expects anything from us here
    if let Err(e) = error_stream.close_write().await {
      let opened = [error_stream.id()];
      return Err(abandon(&session, &opened, StreamType::Error, SessionError::Io(e)).await);
    }

    let data_stream = match session
      .open_stream(headers.with_stream_type(StreamType::Data))
      .await
    {
      Ok(stream) => stream,
      Err(source) => {
        let opened = [error_stream.id()];
        return Err(abandon(&session, &opened, StreamType::Data, source).await);
      }
    };

    tracing::debug!("Forwarded connection established");
    Ok(ForwardedConnection::new(
      session,
      target.clone(),
      port,
      request_id,
      data_stream,
      error_stream,
      self.cancellation.child_token(),
    ))
  }
}

async fn abandon(
  session: &ArcSession,
  opened: &[StreamId],
  stream_type: StreamType,
  source: SessionError,
) -> ForwardError {
  session.remove_streams(opened);
  if let Err(close_error) = session.close().await {
    tracing::debug!(error = %close_error, "Session close failed while abandoning forward");
  }
  ForwardError::StreamCreation {
    stream_type,
    source,
  }
}


#[cfg(test)]
mod tests {
  use std::{
    collections::BTreeSet,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use futures::{future::BoxFuture, FutureExt, StreamExt};

  use super::{ForwardError, ForwardTarget, Forwarder, RequestId, TargetPort};
  use crate::common::session::{
    duplex::{self, DuplexSession, DuplexUpgrader},
    ArcSession, MockSessionUpgrader, SessionError, StreamHeaders, StreamId, StreamType, SubStream,
    UpgradedSession,
  };

  fn target() -> ForwardTarget {
    ForwardTarget::new("default", "web-0")
  }

  #[test]
  fn target_port_accepts_numbers_and_names() {
    assert_eq!(TargetPort::from(8080).as_str(), "8080");
    assert_eq!(TargetPort::from("http").to_string(), "http");
    assert_eq!(target().to_string(), "default/web-0");
  }

  #[tokio::test]
  async fn upgrade_failure_aborts_before_allocating_an_identifier() {
    let mut upgrader = MockSessionUpgrader::new();
    upgrader
      .expect_upgrade()
      .times(1)
      .returning(|_| futures::future::ready(Err(SessionError::Refused("forbidden".into()))).boxed());
    let forwarder = Forwarder::new(upgrader);
    let err = forwarder.forward(&target(), 80).await.unwrap_err();
    assert!(matches!(err, ForwardError::Upgrade(SessionError::Refused(_))));
    assert_eq!(forwarder.last_request_id(), None);
  }

  #[tokio::test]
  async fn error_stream_is_opened_first_with_shared_headers() {
    let (upgrader, mut upgrades) = DuplexUpgrader::fresh();
    let forwarder = Forwarder::new(upgrader);
    for expected_id in ["1", "2"] {
      let _conn = forwarder.forward(&target(), "8080").await.unwrap();
      let (upgraded_to, acceptor) = upgrades.recv().await.unwrap();
      assert_eq!(upgraded_to, target());
      let opened = acceptor
        .into_stream()
        .take(2)
        .map(|s| s.unwrap().headers)
        .collect::<Vec<StreamHeaders>>()
        .await;
      assert_eq!(opened[0].stream_type, StreamType::Error);
      assert_eq!(opened[1].stream_type, StreamType::Data);
      for headers in &opened {
        assert_eq!(headers.port, "8080");
        assert_eq!(headers.request_id, expected_id);
      }
    }
    assert_eq!(forwarder.last_request_id(), Some(RequestId::new(2)));
  }

  #[tokio::test]
  async fn error_stream_write_side_is_closed_immediately() {
    use tokio::io::AsyncReadExt;

    let (session, acceptor) = duplex::pair();
    let forwarder = Forwarder::new(DuplexUpgrader::shared(Arc::new(session)));
    let _conn = forwarder.forward(&target(), 80).await.unwrap();
    let mut incoming = acceptor.into_stream();
    let mut error_stream = incoming.next().await.unwrap().unwrap();
    assert_eq!(error_stream.headers.stream_type, StreamType::Error);
    let mut received = Vec::new();
    tokio::time::timeout(
      Duration::from_secs(5),
      error_stream.stream.read_to_end(&mut received),
    )
    .await
    .expect("error stream must reach end-of-stream")
    .unwrap();
    assert!(received.is_empty());
  }

  #[tokio::test]
  async fn concurrent_forwards_receive_distinct_consecutive_identifiers() {
    const FORWARDS: usize = 16;
    let (session, acceptor) = duplex::pair();
    let forwarder = Arc::new(Forwarder::new(DuplexUpgrader::shared(Arc::new(session))));
    let opens = (0..FORWARDS).map(|_| {
      let forwarder = Arc::clone(&forwarder);
      tokio::task::spawn(async move { forwarder.forward(&target(), 80).await.map(|_| ()) })
    });
    for joined in futures::future::join_all(opens).await {
      joined.unwrap().unwrap();
    }
    let ids = acceptor
      .into_stream()
      .take(FORWARDS * 2)
      .map(|s| s.unwrap().headers.request_id.parse::<u64>().unwrap())
      .collect::<Vec<_>>()
      .await
      .into_iter()
      .collect::<BTreeSet<_>>();
    assert_eq!(ids, (1..=FORWARDS as u64).collect::<BTreeSet<_>>());
  }

  /// Refuses to open data streams, counting the cleanup calls it receives
  struct DataRefusingSession {
    inner: DuplexSession,
    removed: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
  }

  impl UpgradedSession for DataRefusingSession {
    fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>> {
      match headers.stream_type {
        StreamType::Data => futures::future::ready(Err(SessionError::Refused("no data".into()))).boxed(),
        StreamType::Error => self.inner.open_stream(headers),
      }
    }

    fn remove_streams(&self, streams: &[StreamId]) {
      self.removed.fetch_add(streams.len(), Ordering::SeqCst);
      self.inner.remove_streams(streams)
    }

    fn close(&self) -> BoxFuture<'static, Result<(), SessionError>> {
      self.closed.fetch_add(1, Ordering::SeqCst);
      self.inner.close()
    }

    fn set_idle_timeout(&self, timeout: Duration) {
      self.inner.set_idle_timeout(timeout)
    }

    fn idle_timeout(&self) -> Option<Duration> {
      self.inner.idle_timeout()
    }
  }

  #[tokio::test]
  async fn data_stream_failure_releases_error_stream_and_closes_session() {
    let (inner, _acceptor) = duplex::pair();
    let removed = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let session: ArcSession = Arc::new(DataRefusingSession {
      inner,
      removed: Arc::clone(&removed),
      closed: Arc::clone(&closed),
    });
    let mut upgrader = MockSessionUpgrader::new();
    upgrader
      .expect_upgrade()
      .times(1)
      .returning(move |_| futures::future::ready(Ok(Arc::clone(&session))).boxed());
    let forwarder = Forwarder::new(upgrader);
    let err = forwarder.forward(&target(), 80).await.unwrap_err();
    assert!(matches!(
      err,
      ForwardError::StreamCreation {
        stream_type: StreamType::Data,
        ..
      }
    ));
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    // The identifier was spent even though the forward failed
    assert_eq!(forwarder.last_request_id(), Some(RequestId::new(1)));
  }
}
