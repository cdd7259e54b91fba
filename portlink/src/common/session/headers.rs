// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Stream-open headers shared with the remote end of a session
use serde::{Deserialize, Serialize};

use crate::common::forward::{RequestId, TargetPort};

pub const STREAM_TYPE_HEADER: &str = "streamType";
pub const PORT_HEADER: &str = "port";
pub const REQUEST_ID_HEADER: &str = "requestID";

/// The role a sub-stream plays within one forwarded connection
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
  /// Receive-only; the remote writes failure text here
  Error,
  /// Full-duplex application payload
  Data,
}

impl StreamType {
  pub fn as_str(&self) -> &'static str {
    match self {
      StreamType::Error => "error",
      StreamType::Data => "data",
    }
  }
}

impl std::fmt::Display for StreamType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Headers carried by every sub-stream open request
///
/// The remote associates the error and data streams of one forwarded
/// connection by their shared `requestID`, so both must carry the same
/// value, and the error stream must be opened first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHeaders {
  #[serde(rename = "streamType")]
  pub stream_type: StreamType,
  #[serde(rename = "port")]
  pub port: String,
  #[serde(rename = "requestID")]
  pub request_id: String,
}

impl StreamHeaders {
  pub fn new(stream_type: StreamType, port: &TargetPort, request_id: RequestId) -> Self {
    Self {
      stream_type,
      port: port.to_string(),
      request_id: request_id.to_string(),
    }
  }

  /// A copy of these headers for a sibling stream of the same request
  pub fn with_stream_type(&self, stream_type: StreamType) -> Self {
    Self {
      stream_type,
      ..self.clone()
    }
  }

  /// Header name/value pairs as they appear on the wire
  pub fn pairs(&self) -> [(&'static str, &str); 3] {
    [
      (STREAM_TYPE_HEADER, self.stream_type.as_str()),
      (PORT_HEADER, &self.port),
      (REQUEST_ID_HEADER, &self.request_id),
    ]
  }
}

impl std::fmt::Display for StreamHeaders {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut first = true;
    for (name, value) in self.pairs() {
      if !first {
        f.write_str(", ")?;
      }
      write!(f, "{}={}", name, value)?;
      first = false;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::{StreamHeaders, StreamType};
  use crate::common::forward::{RequestId, TargetPort};

  #[test]
  fn serializes_with_wire_header_names() {
    let headers = StreamHeaders::new(StreamType::Error, &TargetPort::from(80), RequestId::new(7));
    let json = serde_json::to_value(&headers).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"streamType": "error", "port": "80", "requestID": "7"})
    );
  }

  #[test]
  fn sibling_headers_share_port_and_request() {
    let error = StreamHeaders::new(StreamType::Error, &"http".into(), RequestId::new(3));
    let data = error.with_stream_type(StreamType::Data);
    assert_eq!(data.stream_type, StreamType::Data);
    assert_eq!(data.port, "http");
    assert_eq!(data.request_id, error.request_id);
    assert_eq!(data.to_string(), "streamType=data, port=http, requestID=3");
  }
}
