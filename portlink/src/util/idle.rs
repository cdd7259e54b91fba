// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Session-wide inactivity tracking
//!
//! Transports that cannot renegotiate an idle timeout after their handshake
//! use an [IdleTimer] to emulate one: sub-stream I/O [touch](IdleTimer::touch)es
//! the timer, and a watchdog waits on [expired](IdleTimer::expired) to tear the
//! session down once no activity has been seen for the configured duration.

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use tokio::{sync::Notify, time::Instant};

#[derive(Debug)]
struct IdleState {
  last_activity: Instant,
  timeout: Option<Duration>,
}

#[derive(Debug)]
struct IdleTimerInner {
  state: Mutex<IdleState>,
  changed: Notify,
}

#[derive(Debug, Clone)]
pub struct IdleTimer {
  inner: Arc<IdleTimerInner>,
}

impl Default for IdleTimer {
  fn default() -> Self {
    Self::new()
  }
}

impl IdleTimer {
  /// Creates a timer with no timeout configured; it will not expire until one is set
  pub fn new() -> Self {
    Self {
      inner: Arc::new(IdleTimerInner {
        state: Mutex::new(IdleState {
          last_activity: Instant::now(),
          timeout: None,
        }),
        changed: Notify::new(),
      }),
    }
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut IdleState) -> R) -> R {
    let mut state = match self.inner.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut state)
  }

  /// Records activity, postponing expiry by a full timeout period
  pub fn touch(&self) {
    self.with_state(|state| state.last_activity = Instant::now());
  }

  /// Replaces the timeout and restarts the inactivity window from now
  ///
  /// A zero duration expires the timer immediately.
  pub fn set_timeout(&self, timeout: Duration) {
    self.with_state(|state| {
      state.timeout = Some(timeout);
      state.last_activity = Instant::now();
    });
    self.inner.changed.notify_waiters();
  }

  pub fn clear_timeout(&self) {
    self.with_state(|state| state.timeout = None);
    self.inner.changed.notify_waiters();
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.with_state(|state| state.timeout)
  }

  fn deadline(&self) -> Option<Instant> {
    self.with_state(|state| state.timeout.map(|timeout| state.last_activity + timeout))
  }

  /// Resolves once a timeout is configured and no activity has occurred within it
  pub async fn expired(&self) {
    loop {
      let notified = self.inner.changed.notified();
      tokio::pin!(notified);
      // Register interest before sampling state so a concurrent change is not missed
      notified.as_mut().enable();
      match self.deadline() {
        None => notified.await,
        Some(deadline) if deadline <= Instant::now() => return,
        Some(deadline) => {
          tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {},
            _ = &mut notified => {},
          }
        }
      }
    }
  }
}
