// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Sessions carried over a QUIC connection
//!
//! The upgrade handshake is the first bidirectional stream of the connection:
//! the client sends the framed JSON [ForwardTarget] and the server answers with
//! a single status byte, followed by a framed reason when refusing. Every later
//! bidirectional stream is a sub-stream, whose first frame holds its JSON
//! [StreamHeaders].
use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use quinn::VarInt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing_futures::Instrument;

use super::{
  ArcSession, IncomingSubStream, SessionError, SessionUpgrader, StreamHeaders, StreamId,
  StreamTable, SubStream, UpgradedSession,
};
use crate::{
  common::forward::ForwardTarget,
  util::{
    framed::{read_frame, read_framed_json, write_frame, write_framed_json},
    idle::IdleTimer,
    tunnel_stream::WrappedStream,
  },
};

const MAX_HEADER_FRAME_LENGTH: usize = 16 * 1024;
const REFUSAL_LINGER: Duration = Duration::from_secs(5);

const UPGRADE_ACCEPTED: u8 = 0;
const UPGRADE_REFUSED: u8 = 1;

const SESSION_CLOSED_CODE: u32 = 0;
const IDLE_TIMEOUT_CODE: u32 = 1;
const UPGRADE_FAILED_CODE: u32 = 2;

impl From<quinn::ConnectionError> for SessionError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::TransportError,
      quinn::ConnectionError::TransportError(_) => Self::TransportError,
      quinn::ConnectionError::ConnectionClosed(_) => Self::ConnectionClosed,
      quinn::ConnectionError::ApplicationClosed(_) => Self::ApplicationClosed,
      quinn::ConnectionError::Reset => Self::TransportError,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
    }
  }
}

/// Dials a portlink server over QUIC and performs the upgrade handshake for each target
pub struct QuinnUpgrader {
  endpoint: quinn::Endpoint,
  server_addr: SocketAddr,
  server_name: String,
}

impl QuinnUpgrader {
  /// `endpoint` must carry a default client config offering [crate::util::ALPN_PORTLINK_1]
  pub fn new(endpoint: quinn::Endpoint, server_addr: SocketAddr, server_name: impl Into<String>) -> Self {
    Self {
      endpoint,
      server_addr,
      server_name: server_name.into(),
    }
  }
}

impl SessionUpgrader for QuinnUpgrader {
  fn upgrade(&self, target: &ForwardTarget) -> BoxFuture<'static, Result<ArcSession, SessionError>> {
    let connecting = self.endpoint.connect(self.server_addr, &self.server_name);
    let target = target.clone();
    let span = tracing::debug_span!("quinn_upgrade", server = %self.server_addr, target = %target);
    async move {
      let connection = connecting
        .map_err(|e| SessionError::Connect(e.to_string()))?
        .await?;
      match request_upgrade(&connection, &target).await {
        Ok(()) => {
          tracing::debug!(remote = %connection.remote_address(), "Session upgraded");
          Ok(Arc::new(QuinnSession::new(connection)) as ArcSession)
        }
        Err(e) => {
          connection.close(VarInt::from_u32(UPGRADE_FAILED_CODE), b"upgrade failed");
          Err(e)
        }
      }
    }
    .instrument(span)
    .boxed()
  }
}

async fn request_upgrade(
  connection: &quinn::Connection,
  target: &ForwardTarget,
) -> Result<(), SessionError> {
  let (mut send, mut recv) = connection.open_bi().await?;
  write_framed_json(&mut send, target, Some(MAX_HEADER_FRAME_LENGTH)).await?;
  send.finish().await.map_err(std::io::Error::from)?;
  match recv.read_u8().await? {
    UPGRADE_ACCEPTED => Ok(()),
    _ => {
      let reason = read_frame(&mut recv, Some(MAX_HEADER_FRAME_LENGTH))
        .await
        .map(|reason| String::from_utf8_lossy(&reason).into_owned())
        .unwrap_or_else(|_| String::from("no reason given"));
      Err(SessionError::Refused(reason))
    }
  }
}

/// A session over one QUIC connection
///
/// QUIC only negotiates an idle timeout during its handshake, so the
/// session-wide idle timeout is enforced locally by an [IdleTimer] watchdog
/// which closes the connection once it expires.
pub struct QuinnSession {
  connection: quinn::Connection,
  streams: Arc<StreamTable>,
  idle: IdleTimer,
  timed_out: Arc<AtomicBool>,
  _watchdog: DropGuard,
}

impl QuinnSession {
  pub fn new(connection: quinn::Connection) -> Self {
    let idle = IdleTimer::new();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = CancellationToken::new();
    tokio::task::spawn(idle_watchdog(
      connection.clone(),
      idle.clone(),
      Arc::clone(&timed_out),
      watchdog.clone(),
    ));
    Self {
      connection,
      streams: Arc::new(StreamTable::new()),
      idle,
      timed_out,
      _watchdog: watchdog.drop_guard(),
    }
  }
}

async fn idle_watchdog(
  connection: quinn::Connection,
  idle: IdleTimer,
  timed_out: Arc<AtomicBool>,
  cancel: CancellationToken,
) {
  tokio::select! {
    _ = cancel.cancelled() => {},
    _ = connection.closed() => {},
    _ = idle.expired() => {
      timed_out.store(true, Ordering::SeqCst);
      tracing::debug!(remote = %connection.remote_address(), "Closing QUIC session after idle timeout");
      connection.close(VarInt::from_u32(IDLE_TIMEOUT_CODE), b"idle timeout");
    }
  }
}

impl UpgradedSession for QuinnSession {
  fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>> {
    let connection = self.connection.clone();
    let streams = Arc::clone(&self.streams);
    let idle = self.idle.clone();
    async move {
      let (mut send, recv) = connection.open_bi().await?;
      write_framed_json(&mut send, &headers, Some(MAX_HEADER_FRAME_LENGTH)).await?;
      idle.touch();
      let id = streams.register(&headers);
      Ok(SubStream::new(id, headers, WrappedStream::Quinn(send, recv)).with_activity(idle))
    }
    .boxed()
  }

  fn remove_streams(&self, streams: &[StreamId]) {
    self.streams.remove(streams);
  }

  fn close(&self) -> BoxFuture<'static, Result<(), SessionError>> {
    // Sample any prior failure before our own close masks it as a local closure
    let prior = self.connection.closed().now_or_never();
    self
      .connection
      .close(VarInt::from_u32(SESSION_CLOSED_CODE), b"session closed");
    self.streams.clear();
    let res = match prior {
      _ if self.timed_out.load(Ordering::SeqCst) => Err(SessionError::TimedOut),
      None | Some(quinn::ConnectionError::LocallyClosed) => Ok(()),
      Some(reason) => Err(reason.into()),
    };
    futures::future::ready(res).boxed()
  }

  fn set_idle_timeout(&self, timeout: Duration) {
    self.idle.set_timeout(timeout);
  }

  fn idle_timeout(&self) -> Option<Duration> {
    self.idle.timeout()
  }
}

/// Serves the remote half of the upgrade handshake on a freshly accepted connection
///
/// `authorize` decides whether the requested target may be reached; its error
/// text is relayed to the client as the refusal reason.
pub async fn accept_upgrade<F>(
  connection: quinn::Connection,
  authorize: F,
) -> Result<
  (
    ForwardTarget,
    BoxStream<'static, Result<IncomingSubStream, SessionError>>,
  ),
  SessionError,
>
where
  F: FnOnce(&ForwardTarget) -> Result<(), String>,
{
  let (mut send, mut recv) = connection.accept_bi().await?;
  let target: ForwardTarget = read_framed_json(&mut recv, Some(MAX_HEADER_FRAME_LENGTH)).await?;
  if let Err(reason) = authorize(&target) {
    tracing::info!(%target, %reason, "Refusing session upgrade");
    send.write_u8(UPGRADE_REFUSED).await?;
    write_frame(&mut send, reason.as_bytes()).await?;
    send.finish().await.ok();
    // Dropping the connection now could discard the reason before the client reads it
    tokio::time::timeout(REFUSAL_LINGER, connection.closed()).await.ok();
    return Err(SessionError::Refused(reason));
  }
  send.write_u8(UPGRADE_ACCEPTED).await?;
  send.finish().await.map_err(std::io::Error::from)?;
  Ok((target, incoming_sub_streams(connection)))
}

/// Sub-streams opened by the client, each with its headers already read
///
/// Ends cleanly when the client closes the session, or after yielding one transport error.
pub fn incoming_sub_streams(
  connection: quinn::Connection,
) -> BoxStream<'static, Result<IncomingSubStream, SessionError>> {
  futures::stream::unfold(Some(connection), |connection| async move {
    let connection = connection?;
    match connection.accept_bi().await {
      Ok((send, mut recv)) => {
        let item = match read_framed_json::<_, StreamHeaders>(&mut recv, Some(MAX_HEADER_FRAME_LENGTH)).await {
          Ok(headers) => Ok(IncomingSubStream {
            headers,
            stream: WrappedStream::Quinn(send, recv),
          }),
          Err(e) => Err(SessionError::from(e)),
        };
        Some((item, Some(connection)))
      }
      Err(quinn::ConnectionError::ApplicationClosed(_))
      | Err(quinn::ConnectionError::LocallyClosed) => None,
      Err(e) => Some((Err(e.into()), None)),
    }
  })
  .boxed()
}
