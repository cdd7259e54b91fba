// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
  sync::mpsc,
  time::Instant,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{ForwardError, ForwardTarget, RequestId, TargetPort};
use crate::common::session::{ArcSession, SessionError, StreamId, SubStream};

/// Network kind reported by [ForwardAddr::network]
pub const NETWORK_NAME: &str = "port-forward";

/// Synthetic address of a forwarded connection; not routable
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForwardAddr(String);

impl ForwardAddr {
  pub fn network(&self) -> &'static str {
    NETWORK_NAME
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ForwardAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// The connection contract satisfied by a forwarded connection
///
/// Deadlines are not per-operation: each one is applied as the idle timeout
/// of the whole underlying session, so every connection sharing that session
/// observes it.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
  fn local_addr(&self) -> ForwardAddr;
  fn remote_addr(&self) -> ForwardAddr;
  fn set_deadline(&self, deadline: Instant);
  fn set_read_deadline(&self, deadline: Instant);
  fn set_write_deadline(&self, deadline: Instant);
  fn close(&mut self) -> BoxFuture<'_, Result<(), CloseError>>;
}

/// One failure observed while closing a connection
#[derive(thiserror::Error, Debug)]
pub enum CloseFailure {
  #[error(transparent)]
  Pending(Arc<ForwardError>),
  #[error("failed to close data stream: {0}")]
  DataStream(#[source] io::Error),
  #[error("failed to close session: {0}")]
  Session(#[source] SessionError),
}

/// Every failure recorded by one close, in the order they occurred
#[derive(Debug)]
pub struct CloseError {
  errors: Vec<CloseFailure>,
}

impl CloseError {
  pub fn errors(&self) -> &[CloseFailure] {
    &self.errors
  }

  pub fn into_errors(self) -> Vec<CloseFailure> {
    self.errors
  }
}

impl std::fmt::Display for CloseError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    for (i, error) in self.errors.iter().enumerate() {
      if i > 0 {
        f.write_str("\n")?;
      }
      write!(f, "{}", error)?;
    }
    Ok(())
  }
}

impl std::error::Error for CloseError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self
      .errors
      .first()
      .map(|e| e as &(dyn std::error::Error + 'static))
  }
}

/// Recovers the [ForwardError] a poisoned connection failed an I/O call with
pub fn poisoning_error(error: &io::Error) -> Option<&ForwardError> {
  let inner = error.get_ref()?;
  inner
    .downcast_ref::<Arc<ForwardError>>()
    .map(|e| e.as_ref())
    .or_else(|| inner.downcast_ref::<ForwardError>())
}

/// A connection to one target port, carried by a data/error sub-stream pair
///
/// Reads and writes go to the data stream. A background watcher drains the
/// error stream; once it reports a failure, every later read and write fails
/// with that failure without touching the data stream.
///
/// End of the data stream is only reported once the error stream has ended
/// too, so a remote failure is never read as a clean end-of-stream. The
/// remote ends its error stream no later than its data stream.
pub struct ForwardedConnection {
  session: ArcSession,
  target: ForwardTarget,
  port: TargetPort,
  request_id: RequestId,
  data: Option<SubStream>,
  data_write_closed: bool,
  error_stream_id: StreamId,
  errors: mpsc::Receiver<ForwardError>,
  poisoned: Option<Arc<ForwardError>>,
  watcher: Option<DropGuard>,
}

impl std::fmt::Debug for ForwardedConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ForwardedConnection")
      .field("target", &self.target)
      .field("port", &self.port)
      .field("request_id", &self.request_id)
      .field("closed", &self.data.is_none())
      .field("poisoned", &self.poisoned)
      .finish_non_exhaustive()
  }
}

impl ForwardedConnection {
  pub(super) fn new(
    session: ArcSession,
    target: ForwardTarget,
    port: TargetPort,
    request_id: RequestId,
    data: SubStream,
    error_stream: SubStream,
    watcher: CancellationToken,
  ) -> Self {
    let (deliver, errors) = mpsc::channel(1);
    let error_stream_id = error_stream.id();
    tokio::task::spawn(watch_error_stream(
      error_stream,
      deliver,
      watcher.clone(),
      request_id,
    ));
    Self {
      session,
      target,
      port,
      request_id,
      data: Some(data),
      data_write_closed: false,
      error_stream_id,
      errors,
      poisoned: None,
      watcher: Some(watcher.drop_guard()),
    }
  }

  pub fn target(&self) -> &ForwardTarget {
    &self.target
  }

  pub fn port(&self) -> &TargetPort {
    &self.port
  }

  pub fn request_id(&self) -> RequestId {
    self.request_id
  }

  pub fn session(&self) -> &ArcSession {
    &self.session
  }

  pub fn local_addr(&self) -> ForwardAddr {
    ForwardAddr(format!("{}:{}", NETWORK_NAME, self.port))
  }

  pub fn remote_addr(&self) -> ForwardAddr {
    ForwardAddr(format!(
      "{}/{}:{}",
      self.target.namespace(),
      self.target.name(),
      self.port
    ))
  }

  /// Applies `deadline` as the idle timeout of the entire session
  ///
  /// Deadlines already in the past become a zero timeout.
  pub fn set_deadline(&self, deadline: Instant) {
    let timeout = deadline.saturating_duration_since(Instant::now());
    tracing::trace!(request_id = %self.request_id, ?timeout, "Applying deadline as session idle timeout");
    self.session.set_idle_timeout(timeout);
  }

  pub fn set_read_deadline(&self, deadline: Instant) {
    self.set_deadline(deadline)
  }

  pub fn set_write_deadline(&self, deadline: Instant) {
    self.set_deadline(deadline)
  }

  /// The failure this connection is poisoned with, if one has been observed
  pub fn poisoned(&self) -> Option<Arc<ForwardError>> {
    self.poisoned.clone()
  }

  /// Waits until the remote reports a failure for this connection
  ///
  /// Resolves to `None` once the error stream has ended without one.
  pub async fn remote_failure(&mut self) -> Option<Arc<ForwardError>> {
    if self.poisoned.is_none() {
      let error = self.errors.recv().await?;
      self.poison(error);
    }
    self.poisoned.clone()
  }

  fn poison(&mut self, error: ForwardError) {
    tracing::debug!(request_id = %self.request_id, %error, "Forwarded connection poisoned");
    self.poisoned = Some(Arc::new(error));
  }

  /// Non-blocking check of the error channel ahead of each data stream operation
  fn check_poisoned(&mut self) -> io::Result<()> {
    if self.poisoned.is_none() {
      if let Ok(error) = self.errors.try_recv() {
        self.poison(error);
      }
    }
    match &self.poisoned {
      Some(error) => Err(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        Arc::clone(error),
      )),
      None => Ok(()),
    }
  }

  /// Holds end-of-stream back until the watcher has either delivered a failure or finished
  fn poll_remote_verdict(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    if self.poisoned.is_none() {
      match self.errors.poll_recv(cx) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(None) => return Poll::Ready(Ok(())),
        Poll::Ready(Some(error)) => self.poison(error),
      }
    }
    Poll::Ready(self.check_poisoned())
  }

  fn data_stream(&mut self) -> io::Result<Pin<&mut SubStream>> {
    self.check_poisoned()?;
    match self.data.as_mut() {
      Some(data) => Ok(Pin::new(data)),
      None => Err(io::Error::new(
        io::ErrorKind::NotConnected,
        ForwardError::Closed,
      )),
    }
  }

  /// Tears down the sub-streams and the session, reporting every failure along the way
  ///
  /// In order: a failure still pending from the error watcher, closing the
  /// data stream unless it was already shut down, then closing the session
  /// once both streams are released. Closing again afterwards does nothing.
  #[tracing::instrument(level = "debug", skip(self), fields(request_id = %self.request_id, port = %self.port))]
  pub async fn close(&mut self) -> Result<(), CloseError> {
    let mut data = match self.data.take() {
      Some(data) => data,
      None => return Ok(()),
    };
    let mut errors = Vec::new();

    // A failure already surfaced through I/O is not reported a second time
    if let Ok(error) = self.errors.try_recv() {
      if self.poisoned.is_none() {
        errors.push(CloseFailure::Pending(Arc::new(error)));
      }
    }

    if !self.data_write_closed {
      if let Err(e) = data.shutdown().await {
        errors.push(CloseFailure::DataStream(e));
      }
    }
    let data_stream_id = data.id();
    drop(data);
    drop(self.watcher.take());

    self
      .session
      .remove_streams(&[data_stream_id, self.error_stream_id]);
    if let Err(e) = self.session.close().await {
      errors.push(CloseFailure::Session(e));
    }

    if errors.is_empty() {
      Ok(())
    } else {
      tracing::debug!(failures = errors.len(), "Forwarded connection closed with errors");
      Err(CloseError { errors })
    }
  }
}

async fn watch_error_stream(
  mut error_stream: SubStream,
  deliver: mpsc::Sender<ForwardError>,
  cancel: CancellationToken,
  request_id: RequestId,
) {
  let mut content = Vec::new();
  let read = tokio::select! {
    biased;
    _ = cancel.cancelled() => return,
    read = error_stream.read_to_end(&mut content) => read,
  };
  let error = match read {
    Err(e) => ForwardError::ErrorStream(e),
    Ok(_) if content.is_empty() => {
      tracing::trace!(%request_id, "Error stream ended cleanly");
      return;
    }
    Ok(_) => ForwardError::Remote(String::from_utf8_lossy(&content).into_owned()),
  };
  tokio::select! {
    biased;
    _ = cancel.cancelled() => {
      tracing::trace!(%request_id, "Discarding error stream failure after teardown");
    }
    delivered = deliver.send(error) => {
      if let Err(mpsc::error::SendError(error)) = delivered {
        tracing::trace!(%request_id, %error, "Discarding error stream failure for a dropped connection");
      }
    }
  }
}

impl AsyncRead for ForwardedConnection {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    let filled = buf.filled().len();
    let res = match this.data_stream() {
      Ok(data) => data.poll_read(cx, buf),
      Err(e) => return Poll::Ready(Err(e)),
    };
    match res {
      Poll::Ready(Ok(())) if buf.filled().len() == filled && buf.remaining() > 0 => {
        this.poll_remote_verdict(cx)
      }
      res => res,
    }
  }
}

impl AsyncWrite for ForwardedConnection {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, io::Error>> {
    match self.get_mut().data_stream() {
      Ok(data) => data.poll_write(cx, buf),
      Err(e) => Poll::Ready(Err(e)),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    match self.get_mut().data_stream() {
      Ok(data) => data.poll_flush(cx),
      Err(e) => Poll::Ready(Err(e)),
    }
  }

  /// Half-closes the data stream; use [ForwardedConnection::close] to release the session
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    let this = self.get_mut();
    match this.data.as_mut() {
      Some(data) => {
        let res = Pin::new(data).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = res {
          this.data_write_closed = true;
        }
        res
      }
      None => Poll::Ready(Ok(())),
    }
  }
}

impl Connection for ForwardedConnection {
  fn local_addr(&self) -> ForwardAddr {
    ForwardedConnection::local_addr(self)
  }

  fn remote_addr(&self) -> ForwardAddr {
    ForwardedConnection::remote_addr(self)
  }

  fn set_deadline(&self, deadline: Instant) {
    ForwardedConnection::set_deadline(self, deadline)
  }

  fn set_read_deadline(&self, deadline: Instant) {
    ForwardedConnection::set_read_deadline(self, deadline)
  }

  fn set_write_deadline(&self, deadline: Instant) {
    ForwardedConnection::set_write_deadline(self, deadline)
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), CloseError>> {
    ForwardedConnection::close(self).boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
  };

  use futures::{future::BoxFuture, FutureExt};
  use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    time::Instant,
  };
  use tokio_util::sync::CancellationToken;

  use super::{poisoning_error, CloseFailure, ForwardedConnection};
  use crate::{
    common::{
      forward::{ForwardError, ForwardTarget, Forwarder},
      session::{
        duplex::{self, DuplexAcceptor, DuplexSession, DuplexUpgrader},
        ArcSession, IncomingSubStream, MockSessionUpgrader, SessionError, StreamHeaders, StreamId,
        StreamType, SubStream, UpgradedSession,
      },
    },
    util::{cancellation::CancellationListener, tunnel_stream::WrappedStream},
  };

  fn target() -> ForwardTarget {
    ForwardTarget::new("default", "web-0")
  }

  async fn forward_over(session: ArcSession) -> ForwardedConnection {
    let mut upgrader = MockSessionUpgrader::new();
    upgrader
      .expect_upgrade()
      .returning(move |_| futures::future::ready(Ok(Arc::clone(&session))).boxed());
    Forwarder::new(upgrader).forward(&target(), 8080).await.unwrap()
  }

  /// Remote halves of the most recent forward, as (error, data)
  async fn remote_pair(acceptor: &mut DuplexAcceptor) -> (IncomingSubStream, IncomingSubStream) {
    let error = acceptor.next().await.unwrap();
    let data = acceptor.next().await.unwrap();
    assert_eq!(error.headers.stream_type, StreamType::Error);
    assert_eq!(data.headers.stream_type, StreamType::Data);
    (error, data)
  }

  #[tokio::test]
  async fn echo_round_trip_then_clean_close() {
    let (session, mut acceptor) = duplex::pair();
    let mut conn = forward_over(Arc::new(session)).await;
    let (remote_error, mut remote_data) = remote_pair(&mut acceptor).await;

    let remote = tokio::task::spawn(async move {
      let mut request = [0u8; 7];
      remote_data.stream.read_exact(&mut request).await.unwrap();
      assert_eq!(&request, b"GET /\r\n");
      remote_data.stream.write_all(b"OK").await.unwrap();
      remote_data.stream.shutdown().await.unwrap();
      drop(remote_error);
      remote_data
    });

    conn.write_all(b"GET /\r\n").await.unwrap();
    let mut response = Vec::new();
    conn.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"OK");
    let _remote_data = remote.await.unwrap();

    conn.close().await.unwrap();
    assert!(conn.remote_failure().await.is_none());
  }

  #[tokio::test]
  async fn remote_failure_poisons_every_later_read_and_write() {
    let (session, mut acceptor) = duplex::pair();
    let mut conn = forward_over(Arc::new(session)).await;
    let (mut remote_error, mut remote_data) = remote_pair(&mut acceptor).await;

    remote_error
      .stream
      .write_all(b"connection refused")
      .await
      .unwrap();
    drop(remote_error);
    let failure = conn.remote_failure().await.expect("remote failure must be reported");
    assert!(matches!(failure.as_ref(), ForwardError::Remote(message) if message == "connection refused"));

    // Data arriving after the failure is never handed back
    remote_data.stream.write_all(b"late").await.unwrap();
    let mut buffer = [0u8; 16];
    for _ in 0..3 {
      let read = conn.read(&mut buffer).await.unwrap_err();
      assert!(read.to_string().contains("connection refused"));
      assert!(matches!(poisoning_error(&read), Some(ForwardError::Remote(_))));
      let write = conn.write(b"ignored").await.unwrap_err();
      assert!(write.to_string().contains("connection refused"));
    }

    // Already surfaced, so close has nothing further to report
    conn.close().await.unwrap();
    let mut reached_remote = Vec::new();
    remote_data
      .stream
      .read_to_end(&mut reached_remote)
      .await
      .unwrap();
    assert!(reached_remote.is_empty());
  }

  #[tokio::test]
  async fn error_stream_ending_without_content_reports_nothing() {
    let (session, mut acceptor) = duplex::pair();
    let mut conn = forward_over(Arc::new(session)).await;
    let (remote_error, _remote_data) = remote_pair(&mut acceptor).await;
    drop(remote_error);
    assert!(conn.remote_failure().await.is_none());
    assert!(conn.poisoned().is_none());
  }

  /// Delegates to an in-memory session but fails every close
  struct FailingCloseSession(DuplexSession);

  impl UpgradedSession for FailingCloseSession {
    fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>> {
      self.0.open_stream(headers)
    }

    fn remove_streams(&self, streams: &[StreamId]) {
      self.0.remove_streams(streams)
    }

    fn close(&self) -> BoxFuture<'static, Result<(), SessionError>> {
      let closed = self.0.close();
      async move {
        closed.await?;
        Err(SessionError::TransportError)
      }
      .boxed()
    }

    fn set_idle_timeout(&self, timeout: Duration) {
      self.0.set_idle_timeout(timeout)
    }

    fn idle_timeout(&self) -> Option<Duration> {
      self.0.idle_timeout()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn close_aggregates_pending_and_session_failures() {
    let (session, mut acceptor) = duplex::pair();
    let mut conn = forward_over(Arc::new(FailingCloseSession(session))).await;
    let (mut remote_error, mut remote_data) = remote_pair(&mut acceptor).await;
    remote_error.stream.write_all(b"pod gone").await.unwrap();
    drop(remote_error);
    // Paused time only advances once the watcher has nothing left to do
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = conn.close().await.unwrap_err();
    let failures = err.errors();
    assert_eq!(failures.len(), 2, "{}", err);
    assert!(
      matches!(&failures[0], CloseFailure::Pending(e) if matches!(e.as_ref(), ForwardError::Remote(m) if m == "pod gone"))
    );
    assert!(matches!(
      &failures[1],
      CloseFailure::Session(SessionError::TransportError)
    ));
    assert!(err.to_string().contains("pod gone"));

    // The data stream is still closed with a failure pending
    let mut reached_remote = Vec::new();
    remote_data
      .stream
      .read_to_end(&mut reached_remote)
      .await
      .unwrap();
    assert!(reached_remote.is_empty());
  }

  /// Fails every read and write, and optionally every shutdown
  struct Broken {
    shutdown_fails: bool,
  }

  fn reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
  }

  impl AsyncRead for Broken {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(Err(reset()))
    }
  }

  impl AsyncWrite for Broken {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
      Poll::Ready(Err(reset()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      if self.shutdown_fails {
        Poll::Ready(Err(reset()))
      } else {
        Poll::Ready(Ok(()))
      }
    }
  }

  /// An in-memory session whose sub-streams of one type are [Broken] locally
  struct BrokenStreamSession {
    inner: DuplexSession,
    broken: StreamType,
    shutdown_fails: bool,
  }

  impl UpgradedSession for BrokenStreamSession {
    fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>> {
      let opened = self.inner.open_stream(headers.clone());
      let (broken, shutdown_fails) = (self.broken, self.shutdown_fails);
      async move {
        let sub_stream = opened.await?;
        if headers.stream_type != broken {
          return Ok(sub_stream);
        }
        let local = WrappedStream::boxed(Broken { shutdown_fails }, Broken { shutdown_fails });
        Ok(SubStream::new(sub_stream.id(), headers, local))
      }
      .boxed()
    }

    fn remove_streams(&self, streams: &[StreamId]) {
      self.inner.remove_streams(streams)
    }

    fn close(&self) -> BoxFuture<'static, Result<(), SessionError>> {
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
  async fn data_stream_close_failure_is_reported() {
    let (inner, _acceptor) = duplex::pair();
    let session = Arc::new(BrokenStreamSession {
      inner,
      broken: StreamType::Data,
      shutdown_fails: true,
    });
    let mut conn = forward_over(Arc::clone(&session) as ArcSession).await;

    let err = conn.close().await.unwrap_err();
    assert!(
      matches!(err.errors(), [CloseFailure::DataStream(e)] if e.kind() == io::ErrorKind::ConnectionReset),
      "{}",
      err
    );
    // The session is still released after the data stream fails to close
    assert!(session.inner.is_closed());
    assert!(session.inner.streams().is_empty());
  }

  #[tokio::test]
  async fn error_stream_read_failure_is_delivered() {
    let (inner, _acceptor) = duplex::pair();
    let session = BrokenStreamSession {
      inner,
      broken: StreamType::Error,
      shutdown_fails: false,
    };
    let mut conn = forward_over(Arc::new(session)).await;

    let failure = conn.remote_failure().await.expect("read failure must be delivered");
    assert!(
      matches!(failure.as_ref(), ForwardError::ErrorStream(e) if e.kind() == io::ErrorKind::ConnectionReset)
    );
    let mut buffer = [0u8; 4];
    let read = conn.read(&mut buffer).await.unwrap_err();
    assert!(matches!(poisoning_error(&read), Some(ForwardError::ErrorStream(_))));
  }

  #[tokio::test]
  async fn cancelled_watcher_ignores_later_failures() {
    let (session, mut acceptor) = duplex::pair();
    let session: ArcSession = Arc::new(session);
    let mut upgrader = MockSessionUpgrader::new();
    upgrader
      .expect_upgrade()
      .returning(move |_| futures::future::ready(Ok(Arc::clone(&session))).boxed());
    let source = CancellationToken::new();
    let forwarder = Forwarder::with_cancellation(upgrader, CancellationListener::from(source.clone()));
    let mut conn = forwarder.forward(&target(), 8080).await.unwrap();
    let (mut remote_error, _remote_data) = remote_pair(&mut acceptor).await;

    source.cancel();
    // Peer may already be gone once the watcher has stopped
    remote_error.stream.write_all(b"too late").await.ok();
    drop(remote_error);

    assert!(conn.remote_failure().await.is_none());
    assert!(conn.poisoned().is_none());
  }

  #[tokio::test]
  async fn end_of_data_waits_for_the_error_stream() {
    let (session, mut acceptor) = duplex::pair();
    let mut conn = forward_over(Arc::new(session)).await;
    let (mut remote_error, mut remote_data) = remote_pair(&mut acceptor).await;

    let remote = tokio::task::spawn(async move {
      remote_data.stream.shutdown().await.unwrap();
      tokio::time::sleep(Duration::from_millis(50)).await;
      remote_error.stream.write_all(b"upstream reset").await.unwrap();
      drop(remote_error);
      remote_data
    });

    let mut buffer = [0u8; 4];
    let read = conn.read(&mut buffer).await.unwrap_err();
    assert!(matches!(poisoning_error(&read), Some(ForwardError::Remote(m)) if m == "upstream reset"));
    let _remote_data = remote.await.unwrap();
  }

  #[tokio::test]
  async fn close_is_a_no_op_the_second_time() {
    let (session, mut acceptor) = duplex::pair();
    let session = Arc::new(session);
    let mut conn = forward_over(Arc::clone(&session) as ArcSession).await;
    let _remote = remote_pair(&mut acceptor).await;
    assert_eq!(session.streams().len(), 2);

    conn.close().await.unwrap();
    assert!(session.is_closed());
    assert!(session.streams().is_empty());
    conn.close().await.unwrap();

    let mut buffer = [0u8; 4];
    let err = conn.read(&mut buffer).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    assert!(matches!(poisoning_error(&err), Some(ForwardError::Closed)));
  }

  #[tokio::test]
  async fn addresses_are_synthetic() {
    let (session, _acceptor) = duplex::pair();
    let conn = forward_over(Arc::new(session)).await;
    let local = conn.local_addr();
    assert_eq!(local.network(), "port-forward");
    assert_eq!(local.to_string(), "port-forward:8080");
    assert_eq!(conn.remote_addr().to_string(), "default/web-0:8080");
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_becomes_session_idle_timeout() {
    let (session, _acceptor) = duplex::pair();
    let session = Arc::new(session);
    let conn = forward_over(Arc::clone(&session) as ArcSession).await;

    conn.set_deadline(Instant::now() + Duration::from_secs(30));
    assert_eq!(session.idle_timeout(), Some(Duration::from_secs(30)));
    conn.set_read_deadline(Instant::now() + Duration::from_secs(5));
    assert_eq!(session.idle_timeout(), Some(Duration::from_secs(5)));
    conn.set_write_deadline(Instant::now() + Duration::from_secs(7));
    assert_eq!(session.idle_timeout(), Some(Duration::from_secs(7)));

    // Past deadlines clamp to zero
    let past = Instant::now();
    tokio::time::advance(Duration::from_secs(1)).await;
    conn.set_deadline(past);
    assert_eq!(session.idle_timeout(), Some(Duration::ZERO));
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_on_one_connection_times_out_its_siblings() {
    let (session, mut acceptor) = duplex::pair();
    let session = Arc::new(session);
    let forwarder = Forwarder::new(DuplexUpgrader::shared(Arc::clone(&session)));
    let first = forwarder.forward(&target(), 80).await.unwrap();
    let mut second = forwarder.forward(&target(), 443).await.unwrap();
    let _first_remote = remote_pair(&mut acceptor).await;
    let _second_remote = remote_pair(&mut acceptor).await;

    first.set_deadline(Instant::now() + Duration::from_secs(10));
    assert_eq!(
      second.session().idle_timeout(),
      Some(Duration::from_secs(10))
    );

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(session.timed_out());
    let err = second.close().await.unwrap_err();
    assert!(matches!(
      err.errors(),
      [CloseFailure::Session(SessionError::TimedOut)]
    ));
  }
}
