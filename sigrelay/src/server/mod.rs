// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing server.
//!
//! The server accepts HTTPS connections from clients holding a certificate issued by the
//! configured certificate authority, and runs the configured signing tool for each `sign`
//! request.

pub(crate) mod config;
pub(crate) mod handlers;
pub mod invoke;
pub mod service;

pub use config::{Config, ServerKey};
