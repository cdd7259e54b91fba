// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{fs, path::PathBuf};
use tracing::instrument;

/// Writes `<path>.pub.pem` and `<path>.priv.pem` for a self-signed certificate naming `host_san`
#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .context("Certificate path must end in a UTF-8 file name")?
    .to_string();
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(path.with_file_name(file_name.clone() + ".pub.pem"), &public_pem)
    .context("Failed writing public key")?;
  fs::write(path.with_file_name(file_name + ".priv.pem"), &private_pem)
    .context("Failed writing private key")?;
  Ok(())
}
