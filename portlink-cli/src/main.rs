// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use portlink::{common::forward::ForwardTarget, util};
use std::{path::PathBuf, time::Duration};

use util::validators::{
  parse_ipaddr, parse_object_name, parse_socketaddr, validate_existing_file, validate_ipaddr,
  validate_object_name, validate_socketaddr,
};

mod certgen;
mod client;
mod server;
mod tls;

fn validate_seconds(v: &str) -> Result<(), String> {
  v.parse::<u64>()
    .map(|_| ())
    .map_err(|_| String::from("Must be a whole number of seconds"))
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("forward")
        .alias("-f")
        .about("Bind a local port, forwarding each connection to a port of a remote target")
        .arg(
          Arg::new("authority")
            .long("authority")
            .short('a')
            .help("PEM certificate trusted in addition to the platform roots")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("server-san")
            .long("server-san")
            .visible_alias("san")
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("namespace")
            .long("namespace")
            .short('n')
            .validator(validate_object_name)
            .takes_value(true)
            .default_value("default"),
        )
        .arg(
          Arg::new("name")
            .help("Name of the target whose port is forwarded")
            .validator(validate_object_name)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("port")
            .help("Port on the target, by number or name; matched by the server")
            .long("port")
            .short('p')
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        )
        .arg(
          Arg::new("idle-timeout")
            .help("Seconds of inactivity after which each forwarded session is closed")
            .long("idle-timeout")
            .validator(validate_seconds)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("serve")
        .alias("-s")
        .about("Accept forwarding sessions, connecting them to local TCP ports")
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("tcp")
            .help("Host whose ports are dialed for forwarded connections")
            .long("tcp")
            .short('i')
            .validator(validate_ipaddr)
            .default_value("127.0.0.1")
            .takes_value(true),
        )
        .arg(
          Arg::new("quic")
            .help("Address accepting forwarding sessions")
            .long("quic")
            .short('q')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:9090")
            .takes_value(true),
        )
        .arg(
          Arg::new("namespace")
            .help("Only accept sessions targeting this namespace")
            .long("namespace")
            .short('n')
            .validator(validate_object_name)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .with_context(|| format!("Missing argument {}", name))
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let target = ForwardTarget::new(
    parse_object_name(required(args, "namespace")?)?,
    parse_object_name(required(args, "name")?)?,
  );
  Ok(client::ClientArgs {
    authority_cert: args.value_of("authority").map(PathBuf::from),
    server_addr: parse_socketaddr(required(args, "server")?)?,
    server_san: required(args, "server-san")?.into(),
    target,
    port: required(args, "port")?.into(),
    listen_addr: parse_socketaddr(required(args, "listen")?)?,
    idle_timeout: args
      .value_of("idle-timeout")
      .map(|secs| secs.parse::<u64>().map(Duration::from_secs))
      .transpose()
      .context("Idle timeout must be a whole number of seconds")?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    cert: PathBuf::from(required(args, "cert")?),
    key: PathBuf::from(required(args, "key")?),
    quinn_bind_addr: parse_socketaddr(required(args, "quic")?)?,
    tcp_host: parse_ipaddr(required(args, "tcp")?)?,
    namespace: args.value_of("namespace").map(parse_object_name).transpose()?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("serve", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("forward", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as forwarder with config {:#?}", config);
      client::client_main(config).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path_raw = required(opts, "path")?;
      let san = required(opts, "san")?;
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    _ => anyhow::bail!("Subcommand is marked as required"),
  }
}
