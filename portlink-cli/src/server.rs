// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use portlink::{
  common::{
    forward::ForwardTarget,
    responder::{Responder, TcpPortDialer},
    session::quinn_session::accept_upgrade,
  },
  util::cancellation::CancellationListener,
};
use std::{
  net::{IpAddr, SocketAddr},
  path::PathBuf,
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::tls;

/// Parameters used to run a portlink server dialing TCP ports for forwarded connections
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub cert: PathBuf,
  pub key: PathBuf,
  pub quinn_bind_addr: SocketAddr,
  pub tcp_host: IpAddr,
  pub namespace: Option<String>,
}

/// Run a portlink server that serves each upgraded session until it closes
#[tracing::instrument(
  skip(config),
  fields(
    tcp = ?config.tcp_host,
    quinn = ?config.quinn_bind_addr,
  ),
  err
)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let server_config = tls::build_server_config(&config.cert, &config.key)?;
  let endpoint = quinn::Endpoint::server(server_config, config.quinn_bind_addr)
    .context("Binding QUIC server endpoint")?;

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };
  let listener = CancellationListener::from(shutdown.clone());

  loop {
    let connecting = tokio::select! {
      _ = shutdown.cancelled() => break,
      connecting = endpoint.accept() => match connecting {
        Some(connecting) => connecting,
        None => break,
      },
    };
    let span = tracing::info_span!("session", remote = %connecting.remote_address());
    tokio::task::spawn(
      serve_session(
        connecting,
        config.tcp_host,
        config.namespace.clone(),
        listener.child_listener(),
      )
      .instrument(span),
    );
  }

  endpoint.close(0u32.into(), b"shutdown");
  endpoint.wait_idle().await;
  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}

async fn serve_session(
  connecting: quinn::Connecting,
  tcp_host: IpAddr,
  namespace: Option<String>,
  shutdown: CancellationListener,
) {
  let connection = match connecting.await {
    Ok(connection) => connection,
    Err(e) => {
      tracing::debug!(error = %e, "Connection failed before upgrade");
      return;
    }
  };
  let authorize = |target: &ForwardTarget| match &namespace {
    Some(namespace) if namespace != target.namespace() => {
      Err(format!("namespace {} is not served here", target.namespace()))
    }
    _ => Ok(()),
  };
  let (target, incoming) = match accept_upgrade(connection, authorize).await {
    Ok(upgraded) => upgraded,
    Err(e) => {
      tracing::info!(error = %e, "Session upgrade failed");
      return;
    }
  };
  tracing::info!(%target, "Session upgraded");
  let responder = Responder::with_cancellation(target, TcpPortDialer::new(tcp_host), shutdown);
  match responder.serve(incoming).await {
    Ok(served) => tracing::info!(served, "Session finished"),
    Err(e) => tracing::info!(error = %e, "Session ended abnormally"),
  }
}
