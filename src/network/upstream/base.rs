/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Transport lifecycle shared by every upstream protocol
//!
//! [`BaseTransport`] owns the state machine `New -> Started -> Closing -> Closed`,
//! the in-flight query counter and the close context. Protocol transports embed
//! it, admit each exchange through [`BaseTransport::begin_query`] and delegate
//! `close` to [`BaseTransport::shutdown`], which cancels waiting queries and
//! then waits (bounded) for the in-flight ones to drain.

use crate::core::error::{DnsError, Result};
use crate::core::signal::Signal;
use crate::network::upstream::TransportType;
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lifecycle state of a transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Started,
    Closing,
    Closed,
}

#[derive(Debug)]
struct LifecycleState {
    state: TransportState,
    in_flight: usize,
    /// Created on the first shutdown that has to wait for queries
    drain: Option<Signal>,
}

pub struct BaseTransport {
    tag: String,
    transport_type: TransportType,
    state: Mutex<LifecycleState>,
    close_ctx: Signal,
}

impl BaseTransport {
    pub fn new(tag: &str, transport_type: TransportType) -> Self {
        Self {
            tag: tag.to_string(),
            transport_type,
            state: Mutex::new(LifecycleState {
                state: TransportState::New,
                in_flight: 0,
                drain: None,
            }),
            close_ctx: Signal::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Signal fired when the transport starts shutting down
    pub fn close_context(&self) -> &Signal {
        &self.close_ctx
    }

    /// Move `New` to `Started`; starting twice is a no-op
    pub fn set_started(&self) -> Result<()> {
        let mut state = self.lock();
        match state.state {
            TransportState::New => {
                state.state = TransportState::Started;
                debug!(tag = %self.tag, kind = %self.transport_type, "Transport started");
                Ok(())
            }
            TransportState::Started => Ok(()),
            TransportState::Closing | TransportState::Closed => Err(DnsError::TransportClosed),
        }
    }

    /// Admit one query
    ///
    /// Returns `None` unless the transport is `Started`. The returned lease
    /// keeps the query counted until it is dropped.
    pub fn begin_query(&self) -> Option<QueryLease<'_>> {
        let mut state = self.lock();
        if state.state != TransportState::Started {
            return None;
        }
        state.in_flight += 1;
        Some(QueryLease { base: self })
    }

    fn end_query(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0
            && state.state == TransportState::Closing
            && let Some(drain) = state.drain.take()
        {
            drain.fire();
        }
    }

    /// Shut the transport down
    ///
    /// Fires the close context so blocked queries give up, then waits up to
    /// `deadline` for the in-flight count to reach zero. The transport ends
    /// `Closed` either way; a missed deadline is reported as a timeout error.
    /// Calling it again after the first call returns immediately.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let drain = {
            let mut state = self.lock();
            match state.state {
                TransportState::Closing | TransportState::Closed => return Ok(()),
                TransportState::New => {
                    state.state = TransportState::Closed;
                    None
                }
                TransportState::Started if state.in_flight == 0 => {
                    state.state = TransportState::Closed;
                    None
                }
                TransportState::Started => {
                    let drain = Signal::new();
                    state.drain = Some(drain.clone());
                    state.state = TransportState::Closing;
                    Some(drain)
                }
            }
        };
        self.close_ctx.fire();

        let Some(drain) = drain else {
            debug!(tag = %self.tag, "Transport closed");
            return Ok(());
        };

        let drained = timeout(deadline, drain.fired()).await;
        let remaining = {
            let mut state = self.lock();
            state.state = TransportState::Closed;
            state.drain = None;
            state.in_flight
        };

        match drained {
            Ok(()) => {
                debug!(tag = %self.tag, "Transport drained and closed");
                Ok(())
            }
            Err(_) => {
                warn!(
                    tag = %self.tag,
                    remaining,
                    "Transport closed before in-flight queries finished"
                );
                Err(DnsError::Timeout("shutdown drain"))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        // State updates are single assignments, a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Debug for BaseTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BaseTransport")
            .field("tag", &self.tag)
            .field("type", &self.transport_type)
            .field("state", &state.state)
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

/// Admission for one in-flight query, released on drop
#[must_use = "the query is only counted while the lease is held"]
pub struct QueryLease<'a> {
    base: &'a BaseTransport,
}

impl Drop for QueryLease<'_> {
    fn drop(&mut self) {
        self.base.end_query();
    }
}
