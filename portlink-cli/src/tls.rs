// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::Duration};

use portlink::util::ALPN_PORTLINK_1;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn transport_config() -> Result<Arc<quinn::TransportConfig>> {
  let mut transport_config = quinn::TransportConfig::default();
  transport_config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
  transport_config.max_idle_timeout(Some(
    MAX_IDLE_TIMEOUT
      .try_into()
      .context("Idle timeout out of range for QUIC")?,
  ));
  Ok(Arc::new(transport_config))
}

pub fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>> {
  let mut reader = BufReader::new(File::open(path).context("Failed opening cert file")?);
  let certs = rustls_pemfile::certs(&mut reader).context("Failed parsing cert file")?;
  anyhow::ensure!(!certs.is_empty(), "No certificates found in {}", path.display());
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

pub fn load_private_key(path: &Path) -> Result<rustls::PrivateKey> {
  let mut reader = BufReader::new(File::open(path).context("Failed opening private key file")?);
  loop {
    match rustls_pemfile::read_one(&mut reader).context("Failed parsing private key file")? {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => anyhow::bail!("No private key found in {}", path.display()),
    }
  }
}

pub fn build_server_config(cert: &Path, key: &Path) -> Result<quinn::ServerConfig> {
  let mut crypto = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(load_certs(cert)?, load_private_key(key)?)
    .context("Certificate and private key were rejected")?;
  crypto.alpn_protocols = vec![ALPN_PORTLINK_1.to_vec()];
  let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  server_config.transport_config(transport_config()?);
  Ok(server_config)
}

/// Trusts the platform roots, plus `authority` when given
pub fn build_client_config(authority: Option<&Path>) -> Result<quinn::ClientConfig> {
  let mut roots = rustls::RootCertStore::empty();
  match rustls_native_certs::load_native_certs() {
    Ok(native) => {
      for cert in native {
        if let Err(e) = roots.add(&rustls::Certificate(cert.0)) {
          tracing::trace!(error = %e, "Skipping unusable platform root certificate");
        }
      }
    }
    Err(e) => tracing::warn!(error = %e, "Platform root certificates unavailable"),
  }
  if let Some(authority) = authority {
    for cert in load_certs(authority)? {
      roots
        .add(&cert)
        .context("Authority certificate was rejected")?;
    }
  }
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  crypto.alpn_protocols = vec![ALPN_PORTLINK_1.to_vec()];
  let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
  client_config.transport_config(transport_config()?);
  Ok(client_config)
}
