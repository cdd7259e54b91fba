// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use portlink::common::{
  forward::{ForwardTarget, Forwarder, TargetPort},
  session::quinn_session::QuinnUpgrader,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::tls;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub server_addr: SocketAddr,
  pub server_san: String,
  pub target: ForwardTarget,
  pub port: String,
  pub listen_addr: SocketAddr,
  pub idle_timeout: Option<Duration>,
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let client_config = tls::build_client_config(config.authority_cert.as_deref())?;
  let bind_addr: SocketAddr = if config.server_addr.is_ipv6() {
    "[::]:0".parse()?
  } else {
    "0.0.0.0:0".parse()?
  };
  let mut endpoint = quinn::Endpoint::client(bind_addr).context("Binding QUIC client endpoint")?;
  endpoint.set_default_client_config(client_config);

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

  let upgrader = QuinnUpgrader::new(endpoint.clone(), config.server_addr, config.server_san.clone());
  let forwarder = Arc::new(Forwarder::with_cancellation(upgrader, shutdown.clone().into()));
  let listener = TcpListener::bind(config.listen_addr)
    .await
    .with_context(|| format!("Binding local listener on {}", config.listen_addr))?;
  tracing::info!(
    listen = %config.listen_addr,
    target = %config.target,
    port = %config.port,
    "Forwarding local connections"
  );

  loop {
    let (tcp, peer) = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted.context("Accepting local connection")?,
    };
    let forwarder = Arc::clone(&forwarder);
    let target = config.target.clone();
    let port = TargetPort::from(config.port.clone());
    let idle_timeout = config.idle_timeout;
    let span = tracing::info_span!("local_connection", %peer);
    tokio::task::spawn(
      async move {
        if let Err(e) = forward_local(&forwarder, tcp, &target, port, idle_timeout).await {
          tracing::warn!(error = %e, "Forwarded connection failed");
        }
      }
      .instrument(span),
    );
  }

  tracing::info!("Disconnecting...");
  endpoint.close(0u32.into(), b"shutdown");
  endpoint.wait_idle().await;
  sigint_handler_task.abort();
  Ok(())
}

async fn forward_local<U>(
  forwarder: &Forwarder<U>,
  mut tcp: TcpStream,
  target: &ForwardTarget,
  port: TargetPort,
  idle_timeout: Option<Duration>,
) -> Result<()>
where
  U: portlink::common::session::SessionUpgrader,
{
  let mut conn = forwarder.forward(target, port).await?;
  tracing::debug!(local = %conn.local_addr(), remote = %conn.remote_addr(), "Connection forwarded");
  if let Some(idle_timeout) = idle_timeout {
    conn.set_deadline(tokio::time::Instant::now() + idle_timeout);
  }
  let copied = tokio::io::copy_bidirectional(&mut tcp, &mut conn).await;
  let closed = conn.close().await;
  let (sent, received) = copied.context("Copying between local and forwarded connection")?;
  tracing::debug!(sent, received, "Local connection finished");
  closed.context("Closing forwarded connection")?;
  Ok(())
}
