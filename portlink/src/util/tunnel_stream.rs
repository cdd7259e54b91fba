// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex byte stream abstracting over the transports a session may run on,
/// allowing use of memory streams, QUIC streams, and arbitrary split halves
pub enum WrappedStream {
  Boxed(
    Box<dyn AsyncRead + Send + Sync + Unpin + 'static>,
    Box<dyn AsyncWrite + Send + Sync + Unpin + 'static>,
  ),
  Quinn(quinn::SendStream, quinn::RecvStream),
  DuplexStream(tokio::io::DuplexStream),
}

impl WrappedStream {
  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn boxed<R, W>(read: R, write: W) -> Self
  where
    R: AsyncRead + Send + Sync + Unpin + 'static,
    W: AsyncWrite + Send + Sync + Unpin + 'static,
  {
    Self::Boxed(Box::new(read), Box::new(write))
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self {
      WrappedStream::Boxed(..) => "Boxed",
      WrappedStream::Quinn(..) => "Quinn",
      WrappedStream::DuplexStream(..) => "DuplexStream",
    };
    f.debug_tuple("WrappedStream").field(&kind).finish()
  }
}

impl From<tokio::io::DuplexStream> for WrappedStream {
  fn from(stream: tokio::io::DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<(quinn::SendStream, quinn::RecvStream)> for WrappedStream {
  fn from((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
    WrappedStream::Quinn(send, recv)
  }
}

impl From<tokio::net::TcpStream> for WrappedStream {
  fn from(stream: tokio::net::TcpStream) -> Self {
    let (read, write) = stream.into_split();
    WrappedStream::boxed(read, write)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(_, ref mut recv) => AsyncRead::poll_read(Pin::new(recv), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Boxed(ref mut s, _) => AsyncRead::poll_read(Pin::new(&mut *s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_write(Pin::new(send), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_write(Pin::new(&mut *s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_flush(Pin::new(send), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut *s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn(ref mut send, _) => AsyncWrite::poll_shutdown(Pin::new(send), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Boxed(_, ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut *s), cx),
    }
  }
}
