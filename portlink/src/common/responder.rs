// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Remote end of forwarded connections
//!
//! Pairs each error stream with the data stream sharing its `requestID`,
//! dials the requested port, and proxies the data stream to it. Dial and
//! proxy failures are reported as text on the error stream, which always
//! ends before its data stream does.

use std::{
  collections::VecDeque,
  io,
  net::{IpAddr, Ipv4Addr, SocketAddr},
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use futures::{
  future::{BoxFuture, FutureExt},
  stream::BoxStream,
  StreamExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
  net::TcpStream,
  task::JoinSet,
};
use tracing_futures::Instrument;

use crate::{
  common::{
    forward::ForwardTarget,
    session::{IncomingSubStream, SessionError, StreamHeaders, StreamType},
  },
  util::{cancellation::CancellationListener, tunnel_stream::WrappedStream},
};

/// Error streams held while waiting for their data stream; the oldest is dropped beyond this
pub const MAX_UNPAIRED_ERROR_STREAMS: usize = 32;

/// Connects to a port on behalf of a forwarded connection
pub trait PortDialer: Send + Sync {
  fn dial(&self, target: &ForwardTarget, port: &str) -> BoxFuture<'static, io::Result<WrappedStream>>;
}

impl<T: PortDialer + ?Sized> PortDialer for Arc<T> {
  fn dial(&self, target: &ForwardTarget, port: &str) -> BoxFuture<'static, io::Result<WrappedStream>> {
    self.as_ref().dial(target, port)
  }
}

/// Dials numeric TCP ports on a single host, loopback unless configured otherwise
#[derive(Debug, Clone)]
pub struct TcpPortDialer {
  host: IpAddr,
}

impl Default for TcpPortDialer {
  fn default() -> Self {
    Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
  }
}

impl TcpPortDialer {
  pub fn new(host: IpAddr) -> Self {
    Self { host }
  }
}

impl PortDialer for TcpPortDialer {
  fn dial(&self, _target: &ForwardTarget, port: &str) -> BoxFuture<'static, io::Result<WrappedStream>> {
    let port = match port.parse::<u16>() {
      Ok(port) => port,
      Err(_) => {
        return futures::future::ready(Err(io::Error::new(
          io::ErrorKind::InvalidInput,
          format!("invalid port {:?}", port),
        )))
        .boxed()
      }
    };
    let addr = SocketAddr::new(self.host, port);
    async move {
      tracing::debug!(%addr, "Dialing forwarded port");
      let stream = TcpStream::connect(addr).await?;
      stream.set_nodelay(true)?;
      Ok(WrappedStream::from(stream))
    }
    .boxed()
  }
}

/// Serves every forwarded connection arriving on one session to one target
pub struct Responder<D> {
  target: ForwardTarget,
  dialer: Arc<D>,
  cancellation: CancellationListener,
}

impl<D> Responder<D>
where
  D: PortDialer + 'static,
{
  pub fn new(target: ForwardTarget, dialer: D) -> Self {
    Self::with_cancellation(target, dialer, CancellationListener::detached())
  }

  pub fn with_cancellation(target: ForwardTarget, dialer: D, cancellation: CancellationListener) -> Self {
    Self {
      target,
      dialer: Arc::new(dialer),
      cancellation,
    }
  }

  /// Serves sub-streams until the session ends, returning the number of connections served
  ///
  /// In-flight connections are awaited when the session ends cleanly, and
  /// aborted on cancellation or on a session failure.
  #[tracing::instrument(level = "debug", skip_all, fields(target = %self.target), err)]
  pub async fn serve(
    &self,
    mut incoming: BoxStream<'static, Result<IncomingSubStream, SessionError>>,
  ) -> Result<usize, SessionError> {
    let mut awaiting_data: VecDeque<(String, WrappedStream)> = VecDeque::new();
    let mut connections = JoinSet::new();
    let mut served = 0usize;
    loop {
      let next = tokio::select! {
        _ = self.cancellation.cancelled() => {
          tracing::debug!("Responder cancelled");
          connections.shutdown().await;
          return Ok(served);
        },
        next = incoming.next() => next,
      };
      let IncomingSubStream { headers, stream } = match next {
        None => break,
        Some(Ok(sub_stream)) => sub_stream,
        Some(Err(e)) => {
          tracing::warn!(error = %e, "Session failed while accepting sub-streams");
          connections.shutdown().await;
          return Err(e);
        }
      };
      match headers.stream_type {
        StreamType::Error => {
          if let Some(i) = position_of(&awaiting_data, &headers.request_id) {
            tracing::warn!(request_id = %headers.request_id, "Duplicate error stream replaced an unpaired one");
            if let Some((_, replaced)) = awaiting_data.remove(i) {
              reject(replaced).await;
            }
          }
          if awaiting_data.len() >= MAX_UNPAIRED_ERROR_STREAMS {
            if let Some((request_id, evicted)) = awaiting_data.pop_front() {
              tracing::warn!(%request_id, "Dropping error stream whose data stream never arrived");
              reject(evicted).await;
            }
          }
          awaiting_data.push_back((headers.request_id, stream));
        }
        StreamType::Data => match position_of(&awaiting_data, &headers.request_id)
          .and_then(|i| awaiting_data.remove(i))
        {
          Some((_, error_stream)) => {
            served += 1;
            let span = tracing::debug_span!("forwarded_connection", request_id = %headers.request_id, port = %headers.port);
            connections.spawn(
              serve_pair(
                Arc::clone(&self.dialer),
                self.target.clone(),
                headers,
                error_stream,
                stream,
              )
              .instrument(span),
            );
          }
          None => {
            tracing::warn!(request_id = %headers.request_id, "Rejecting data stream without a preceding error stream");
            reject(stream).await;
          }
        },
      }
    }
    while connections.join_next().await.is_some() {}
    tracing::debug!(served, unpaired = awaiting_data.len(), "Session ended");
    Ok(served)
  }
}

fn position_of(awaiting_data: &VecDeque<(String, WrappedStream)>, request_id: &str) -> Option<usize> {
  awaiting_data.iter().position(|(id, _)| id == request_id)
}

async fn reject(mut stream: WrappedStream) {
  if let Err(e) = stream.shutdown().await {
    tracing::trace!(error = %e, "Rejected stream was already closed");
  }
}

/// The remote half of a data stream, ending its error stream first whenever the data stream is shut down
struct Exchange {
  data: WrappedStream,
  error_stream: Option<WrappedStream>,
}

impl Exchange {
  /// Reports `failure` on the error stream if it is still open, then ends the data stream
  async fn fail(mut self, failure: String) {
    match self.error_stream.take() {
      Some(mut error_stream) => {
        tracing::info!(%failure, "Reporting forwarding failure");
        let reported = async {
          error_stream.write_all(failure.as_bytes()).await?;
          error_stream.shutdown().await
        };
        if let Err(e) = reported.await {
          tracing::debug!(error = %e, "Failure could not be reported to the client");
        }
      }
      None => tracing::debug!(%failure, "Forwarding failed after the error stream ended"),
    }
    reject(self.data).await;
  }
}

impl AsyncRead for Exchange {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
  }
}

impl AsyncWrite for Exchange {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().data).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().data).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if let Some(error_stream) = this.error_stream.as_mut() {
      if let Err(e) = futures::ready!(Pin::new(error_stream).poll_shutdown(cx)) {
        tracing::trace!(error = %e, "Error stream was already closed");
      }
      this.error_stream = None;
    }
    Pin::new(&mut this.data).poll_shutdown(cx)
  }
}

async fn serve_pair<D: PortDialer + ?Sized>(
  dialer: Arc<D>,
  target: ForwardTarget,
  headers: StreamHeaders,
  error_stream: WrappedStream,
  data_stream: WrappedStream,
) {
  let mut exchange = Exchange {
    data: data_stream,
    error_stream: Some(error_stream),
  };
  let mut upstream = match dialer.dial(&target, &headers.port).await {
    Ok(upstream) => upstream,
    Err(e) => {
      let failure = format!("error forwarding port {} to {}: {}", headers.port, target, e);
      return exchange.fail(failure).await;
    }
  };
  match tokio::io::copy_bidirectional(&mut exchange, &mut upstream).await {
    Ok((to_upstream, from_upstream)) => {
      tracing::debug!(to_upstream, from_upstream, "Forwarded connection finished");
      if let Some(error_stream) = exchange.error_stream.take() {
        reject(error_stream).await;
      }
    }
    Err(e) => {
      let failure = format!("error copying port {} of {}: {}", headers.port, target, e);
      exchange.fail(failure).await
    }
  }
}
