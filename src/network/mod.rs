/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Network layer: wire framing, TLS settings and the upstream transports

pub(crate) mod tls_config;
pub mod transport;
pub mod upstream;
