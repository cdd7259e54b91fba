// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory sessions, whose remote end is a [DuplexAcceptor] in the same process
#![deny(unused_imports, dead_code)]
use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use futures::{
  future::{self, BoxFuture},
  stream::BoxStream,
  FutureExt, StreamExt,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
  ArcSession, IncomingSubStream, SessionError, SessionUpgrader, StreamHeaders, StreamId,
  StreamTable, SubStream, UpgradedSession,
};
use crate::{
  common::forward::ForwardTarget,
  util::{idle::IdleTimer, tunnel_stream::WrappedStream},
};

const DEFAULT_STREAM_BUFFER: usize = 8192;

struct DuplexSessionShared {
  to_remote: Mutex<Option<UnboundedSender<IncomingSubStream>>>,
  timed_out: AtomicBool,
}

impl DuplexSessionShared {
  fn shut(&self) -> bool {
    let sender = match self.to_remote.lock() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    sender.is_some()
  }

  fn sender(&self) -> Option<UnboundedSender<IncomingSubStream>> {
    match self.to_remote.lock() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }
}

/// The local end of an in-memory session
pub struct DuplexSession {
  shared: Arc<DuplexSessionShared>,
  streams: Arc<StreamTable>,
  idle: IdleTimer,
  stream_buffer: usize,
  _watchdog: DropGuard,
}

/// The remote end of an in-memory session, receiving sub-streams in the order they were opened
pub struct DuplexAcceptor {
  incoming: UnboundedReceiver<IncomingSubStream>,
}

/// Creates an entangled session pair; must be called from within a tokio runtime
pub fn pair() -> (DuplexSession, DuplexAcceptor) {
  pair_with_buffer(DEFAULT_STREAM_BUFFER)
}

pub fn pair_with_buffer(stream_buffer: usize) -> (DuplexSession, DuplexAcceptor) {
  let (to_remote, incoming) = mpsc::unbounded_channel();
  let shared = Arc::new(DuplexSessionShared {
    to_remote: Mutex::new(Some(to_remote)),
    timed_out: AtomicBool::new(false),
  });
  let idle = IdleTimer::new();
  let watchdog = CancellationToken::new();
  tokio::task::spawn({
    let (shared, idle, watchdog) = (Arc::clone(&shared), idle.clone(), watchdog.clone());
    async move {
      tokio::select! {
        _ = watchdog.cancelled() => {},
        _ = idle.expired() => {
          if shared.shut() {
            shared.timed_out.store(true, Ordering::SeqCst);
            tracing::debug!("In-memory session closed after idle timeout");
          }
        }
      }
    }
  });
  let session = DuplexSession {
    shared,
    streams: Arc::new(StreamTable::new()),
    idle,
    stream_buffer,
    _watchdog: watchdog.drop_guard(),
  };
  (session, DuplexAcceptor { incoming })
}

impl DuplexSession {
  pub fn is_closed(&self) -> bool {
    self.shared.sender().is_none()
  }

  pub fn timed_out(&self) -> bool {
    self.shared.timed_out.load(Ordering::SeqCst)
  }

  pub fn streams(&self) -> &StreamTable {
    &self.streams
  }
}

impl UpgradedSession for DuplexSession {
  fn open_stream(&self, headers: StreamHeaders) -> BoxFuture<'static, Result<SubStream, SessionError>> {
    let res = match self.shared.sender() {
      None if self.timed_out() => Err(SessionError::TimedOut),
      None => Err(SessionError::LocallyClosed),
      Some(to_remote) => {
        let (local, remote) = WrappedStream::duplex(self.stream_buffer);
        let incoming = IncomingSubStream {
          headers: headers.clone(),
          stream: remote,
        };
        match to_remote.send(incoming) {
          Err(_) => Err(SessionError::ConnectionClosed),
          Ok(()) => {
            self.idle.touch();
            let id = self.streams.register(&headers);
            Ok(SubStream::new(id, headers, local).with_activity(self.idle.clone()))
          }
        }
      }
    };
    future::ready(res).boxed()
  }

  fn remove_streams(&self, streams: &[StreamId]) {
    let removed = self.streams.remove(streams);
    tracing::trace!(requested = streams.len(), removed, "Removed in-memory sub-streams");
  }

  fn close(&self) -> BoxFuture<'static, Result<(), SessionError>> {
    let res = if self.shared.shut() {
      Ok(())
    } else if self.timed_out() {
      Err(SessionError::TimedOut)
    } else {
      Ok(())
    };
    self.streams.clear();
    future::ready(res).boxed()
  }

  fn set_idle_timeout(&self, timeout: Duration) {
    self.idle.set_timeout(timeout);
  }

  fn idle_timeout(&self) -> Option<Duration> {
    self.idle.timeout()
  }
}

impl DuplexAcceptor {
  pub async fn next(&mut self) -> Option<IncomingSubStream> {
    self.incoming.recv().await
  }

  /// Incoming sub-streams until the session is closed
  pub fn into_stream(self) -> BoxStream<'static, Result<IncomingSubStream, SessionError>> {
    tokio_stream::wrappers::UnboundedReceiverStream::new(self.incoming)
      .map(Ok)
      .boxed()
  }
}

enum UpgradeMode {
  Fresh(UnboundedSender<(ForwardTarget, DuplexAcceptor)>),
  Shared(Arc<DuplexSession>),
}

/// Upgrades to in-memory sessions
///
/// In `fresh` mode every upgrade creates a new pair and hands its acceptor to the
/// returned receiver; in `shared` mode every upgrade yields the same session.
pub struct DuplexUpgrader {
  mode: UpgradeMode,
}

impl DuplexUpgrader {
  pub fn fresh() -> (Self, UnboundedReceiver<(ForwardTarget, DuplexAcceptor)>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
      Self {
        mode: UpgradeMode::Fresh(sender),
      },
      receiver,
    )
  }

  pub fn shared(session: Arc<DuplexSession>) -> Self {
    Self {
      mode: UpgradeMode::Shared(session),
    }
  }
}

impl SessionUpgrader for DuplexUpgrader {
  fn upgrade(&self, target: &ForwardTarget) -> BoxFuture<'static, Result<ArcSession, SessionError>> {
    let res = match &self.mode {
      UpgradeMode::Shared(session) => Ok(Arc::clone(session) as ArcSession),
      UpgradeMode::Fresh(acceptors) => {
        let (session, acceptor) = pair();
        acceptors
          .send((target.clone(), acceptor))
          .map(|()| Arc::new(session) as ArcSession)
          .map_err(|_| SessionError::Refused(String::from("No acceptor is listening")))
      }
    };
    future::ready(res).boxed()
  }
}
