// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  v.parse::<std::net::IpAddr>()
    .map_err(|_| AnyErr::msg("Could not parse input as ipv4 or ipv6 address"))
}

/// Kubernetes-style object names: lowercase alphanumerics and '-', at most 253 characters
pub fn parse_object_name(v: &str) -> Result<String> {
  if v.is_empty() || v.len() > 253 {
    return Err(AnyErr::msg("Names must be between 1 and 253 characters long"));
  }
  let valid_chars = v
    .chars()
    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
  let valid_ends = v
    .chars()
    .next()
    .zip(v.chars().last())
    .map_or(false, |(first, last)| {
      first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
    });
  if !valid_chars || !valid_ends {
    return Err(AnyErr::msg(
      "Names may only contain lowercase alphanumerics, '-' and '.', and must start and end with an alphanumeric",
    ));
  }
  Ok(v.to_string())
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_object_name(v: &str) -> Result<(), String> {
  parse_object_name(v).map(|_| ()).map_err(|e| e.to_string())
}
