// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Tags the error/data sub-stream pair of one forwarded connection
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(u64);

impl RequestId {
  pub fn new(inner: u64) -> RequestId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for RequestId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<RequestId> for u64 {
  fn from(id: RequestId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("RequestId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for RequestId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for RequestId {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.parse().map(RequestId)
  }
}

/// Instance-scoped allocator; independent generators never coordinate
pub struct MonotonicRequestIdGenerator {
  next: AtomicU64,
}

impl Default for MonotonicRequestIdGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl MonotonicRequestIdGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> RequestId {
    RequestId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }

  /// The most recently allocated identifier, if any
  pub fn last(&self) -> Option<RequestId> {
    match self.next.load(Ordering::Relaxed) {
      0 | 1 => None,
      next => Some(RequestId::new(next - 1)),
    }
  }
}
