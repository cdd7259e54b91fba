// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Upgraded sessions and the named sub-streams multiplexed within them
//!
//! A session is one upgraded, stream-capable connection to a remote endpoint.
//! Establishing it (authentication, TLS, the upgrade handshake) belongs to a
//! [SessionUpgrader]; everything above this module only sees the narrow
//! [UpgradedSession] contract.

use std::{
  pin::Pin,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  task::{Context, Poll},
  time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
  common::forward::ForwardTarget,
  util::{framed::FrameError, idle::IdleTimer, tunnel_stream::WrappedStream},
};

pub mod duplex;
pub mod headers;
pub mod quinn_session;

pub use headers::{StreamHeaders, StreamType};

pub type ArcSession = Arc<dyn UpgradedSession>;

/// Session-local identifier of an opened sub-stream
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct StreamId(u64);

impl StreamId {
  pub fn new(inner: u64) -> StreamId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Session closed")]
  ConnectionClosed,
  #[error("Session closed by application")]
  ApplicationClosed,
  #[error("Session timed out")]
  TimedOut,
  #[error("Transport error encountered")]
  TransportError,
  #[error("Session closed locally")]
  LocallyClosed,
  #[error("Failed to initiate session: {0}")]
  Connect(String),
  #[error("Upgrade refused by remote: {0}")]
  Refused(String),
  #[error("Stream header exchange failed: {0}")]
  Headers(#[from] FrameError),
  #[error("Session I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

/// One upgraded, stream-capable transport connection
///
/// Implementations must be shareable: several forwarded connections may
/// hold the same session, in which case every operation here is visible
/// to all of them.
pub trait UpgradedSession: Send + Sync {
  /// Opens a named sub-stream, sending `headers` to the remote as part of the open request
  fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>>;

  /// Signals that the given sub-streams are no longer needed by their owner
  fn remove_streams(&self, streams: &[StreamId]);

  /// Closes the whole session, including every sub-stream opened against it
  ///
  /// Reports an error if the session had already failed before being closed.
  fn close(&self) -> BoxFuture<'static, Result<(), SessionError>>;

  /// Applies an inactivity timeout to the entire session
  fn set_idle_timeout(&self, timeout: Duration);

  fn idle_timeout(&self) -> Option<Duration>;
}

/// The upgrade capability: turns a target reference into a live session
#[cfg_attr(test, mockall::automock)]
pub trait SessionUpgrader: Send + Sync {
  fn upgrade(&self, target: &ForwardTarget) -> BoxFuture<'static, Result<ArcSession, SessionError>>;
}

impl<T> SessionUpgrader for Arc<T>
where
  T: SessionUpgrader + ?Sized,
{
  fn upgrade(&self, target: &ForwardTarget) -> BoxFuture<'static, Result<ArcSession, SessionError>> {
    T::upgrade(self, target)
  }
}

/// A sub-stream as seen by the remote end of a session
#[derive(Debug)]
pub struct IncomingSubStream {
  pub headers: StreamHeaders,
  pub stream: WrappedStream,
}

/// Concurrent record of the sub-streams a session currently tracks
#[derive(Debug, Default)]
pub struct StreamTable {
  streams: DashMap<StreamId, StreamHeaders>,
  next: AtomicU64,
}

impl StreamTable {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn register(&self, headers: &StreamHeaders) -> StreamId {
    let id = StreamId::new(self.next.fetch_add(1, Ordering::Relaxed));
    self.streams.insert(id, headers.clone());
    id
  }

  /// Forgets the given streams, returning how many were still tracked
  pub fn remove(&self, ids: &[StreamId]) -> usize {
    ids
      .iter()
      .filter(|id| self.streams.remove(*id).is_some())
      .count()
  }

  pub fn headers(&self, id: StreamId) -> Option<StreamHeaders> {
    self.streams.get(&id).map(|entry| entry.value().clone())
  }

  pub fn len(&self) -> usize {
    self.streams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.streams.is_empty()
  }

  pub fn clear(&self) {
    self.streams.clear();
  }
}

pin_project_lite::pin_project! {
  /// A named byte channel opened against a session
  pub struct SubStream {
    id: StreamId,
    headers: StreamHeaders,
    #[pin]
    inner: WrappedStream,
    activity: Option<IdleTimer>,
  }
}

impl SubStream {
  pub fn new(id: StreamId, headers: StreamHeaders, inner: impl Into<WrappedStream>) -> Self {
    Self {
      id,
      headers,
      inner: inner.into(),
      activity: None,
    }
  }

  /// Reports successful I/O on this stream as session activity
  pub fn with_activity(mut self, activity: IdleTimer) -> Self {
    self.activity = Some(activity);
    self
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn headers(&self) -> &StreamHeaders {
    &self.headers
  }

  /// Half-closes the stream; the remote observes end-of-stream, while reads remain possible
  pub async fn close_write(&mut self) -> std::io::Result<()> {
    self.shutdown().await
  }
}

impl std::fmt::Debug for SubStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SubStream")
      .field("id", &self.id)
      .field("headers", &self.headers)
      .finish_non_exhaustive()
  }
}

impl AsyncRead for SubStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();
    let res = this.inner.poll_read(cx, buf);
    if let (Poll::Ready(Ok(())), Some(activity)) = (&res, this.activity) {
      activity.touch();
    }
    res
  }
}

impl AsyncWrite for SubStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.project();
    let res = this.inner.poll_write(cx, buf);
    if let (Poll::Ready(Ok(_)), Some(activity)) = (&res, this.activity) {
      activity.touch();
    }
    res
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}
