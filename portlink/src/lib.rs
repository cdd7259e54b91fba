// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Port forwarding over upgraded, stream-multiplexed sessions
//!
//! See [common::forward::Forwarder] for the entry point.

pub mod common;
pub mod util;
