// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames, used by transports that carry stream headers in-band

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
  #[error("Frame write failure: {0}")]
  Write(#[source] std::io::Error),
  #[error("Frame content was not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, FrameError> {
  let length = s
    .read_u32()
    .await
    .map_err(|error| FrameError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(FrameError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| FrameError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), FrameError> {
  s.write_u32(buffer.len() as u32)
    .await
    .map_err(FrameError::Write)?;
  s.write_all(buffer).await.map_err(FrameError::Write)?;
  s.flush().await.map_err(FrameError::Write)
}

pub async fn read_framed_json<TStream, TOutput>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, FrameError>
where
  TStream: AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
{
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

/// Serializes `value` into a single frame
///
/// Nothing is written if the encoded frame would exceed `max_length`.
pub async fn write_framed_json<TStream, TInput>(
  s: TStream,
  value: &TInput,
  max_length: Option<usize>,
) -> Result<(), FrameError>
where
  TStream: AsyncWrite + Unpin,
  TInput: serde::Serialize + ?Sized,
{
  let buffer = serde_json::to_vec(value)?;
  if let Some(max_length) = max_length {
    if buffer.len() + LENGTH_PREFIX_SIZE > max_length {
      return Err(FrameError::MaxLengthExceeded {
        expected: max_length,
        received: buffer.len() + LENGTH_PREFIX_SIZE,
      });
    }
  }
  write_frame(s, &buffer).await
}
