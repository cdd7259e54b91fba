// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cancellation;
pub mod framed;
pub mod idle;
pub mod tunnel_stream;
pub mod validators;

// ALPN protocol name for portlink session transports
pub const ALPN_PORTLINK_1: &[u8] = b"portlink-1";
