/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Single-flight connection management
//!
//! A [`Connector`] hands out one shared connection to any number of concurrent
//! callers. At most one dial runs at a time; callers arriving while it runs
//! wait for that dial's outcome instead of starting their own. A dead or reset
//! connection is replaced lazily by the next caller.
//!
//! [`Connection`] wraps a raw I/O handle with a close-once latch: the first
//! close records the reason and wakes everyone watching the connection.

use crate::core::error::{DnsError, Result};
use crate::core::signal::Signal;
use futures::future::BoxFuture;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::select;
use tracing::debug;

/// Produces a fresh connection
pub type DialFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

type ConnFn<T, R> = Box<dyn Fn(&T) -> R + Send + Sync>;

/// How the connector inspects and tears down a connection value
pub struct ConnectorCallbacks<T> {
    pub is_closed: ConnFn<T, bool>,
    /// Called when the connector itself shuts down
    pub close: ConnFn<T, ()>,
    /// Called when the connection is dropped so the next caller redials
    pub reset: ConnFn<T, ()>,
}

/// Identity of a shared connection value
pub trait SameConnection {
    fn same_connection(&self, other: &Self) -> bool;
}

impl<S> SameConnection for Arc<Connection<S>> {
    fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

/// One dial attempt that other callers can wait on
struct DialEpisode<T> {
    done: Signal,
    outcome: OnceLock<std::result::Result<T, DnsError>>,
}

enum Claim<T> {
    Wait(Arc<DialEpisode<T>>),
    Dial(Arc<DialEpisode<T>>),
}

enum Slot<T> {
    Idle,
    Dialing(Arc<DialEpisode<T>>),
    Ready(T),
}

struct ConnectorState<T> {
    slot: Slot<T>,
    closed: bool,
}

pub struct Connector<T> {
    dial: DialFn<T>,
    callbacks: ConnectorCallbacks<T>,
    state: Mutex<ConnectorState<T>>,
    close_ctx: Signal,
}

impl<T> Connector<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `close_ctx` aborts in-progress dials and waits when fired
    pub fn new(close_ctx: Signal, dial: DialFn<T>, callbacks: ConnectorCallbacks<T>) -> Self {
        Self {
            dial,
            callbacks,
            state: Mutex::new(ConnectorState {
                slot: Slot::Idle,
                closed: false,
            }),
            close_ctx,
        }
    }

    /// Return the shared connection, dialing one if needed
    pub async fn get(&self) -> Result<T> {
        loop {
            let claim = {
                let mut state = self.lock();
                if state.closed {
                    return Err(DnsError::TransportClosed);
                }
                let dialing = match &state.slot {
                    Slot::Ready(conn) if !(self.callbacks.is_closed)(conn) => {
                        return Ok(conn.clone());
                    }
                    Slot::Dialing(episode) => Some(episode.clone()),
                    Slot::Ready(_) | Slot::Idle => None,
                };
                match dialing {
                    Some(episode) => Claim::Wait(episode),
                    None => {
                        let episode = Arc::new(DialEpisode {
                            done: Signal::new(),
                            outcome: OnceLock::new(),
                        });
                        state.slot = Slot::Dialing(episode.clone());
                        Claim::Dial(episode)
                    }
                }
            };

            let episode = match claim {
                Claim::Dial(episode) => return self.dial_owned(episode).await,
                Claim::Wait(episode) => episode,
            };
            select! {
                _ = episode.done.fired() => {}
                _ = self.close_ctx.fired() => return Err(DnsError::TransportClosed),
            }
            match episode.outcome.get() {
                Some(Ok(conn)) => return Ok(conn.clone()),
                Some(Err(e)) => return Err(e.replicate()),
                // The dialing caller went away, try again.
                None => continue,
            }
        }
    }

    async fn dial_owned(&self, episode: Arc<DialEpisode<T>>) -> Result<T> {
        let mut guard = DialGuard {
            connector: self,
            episode: &episode,
            armed: true,
        };
        let result = self.dial_with_cancellation().await;

        let outcome = {
            let mut state = self.lock();
            match result {
                Err(e) => {
                    state.slot = Slot::Idle;
                    Err(e)
                }
                Ok(conn) if state.closed => {
                    (self.callbacks.close)(&conn);
                    state.slot = Slot::Idle;
                    Err(DnsError::TransportClosed)
                }
                Ok(conn) => {
                    state.slot = Slot::Ready(conn.clone());
                    Ok(conn)
                }
            }
        };
        guard.armed = false;

        let shared = match &outcome {
            Ok(conn) => Ok(conn.clone()),
            Err(e) => Err(e.replicate()),
        };
        let _ = episode.outcome.set(shared);
        episode.done.fire();
        outcome
    }

    async fn dial_with_cancellation(&self) -> Result<T> {
        select! {
            res = (self.dial)() => res,
            _ = self.close_ctx.fired() => Err(DnsError::TransportClosed),
        }
    }

    /// Drop the current connection; the next `get` dials a new one
    ///
    /// A dial in progress is left alone.
    pub fn reset(&self) {
        let mut state = self.lock();
        let Slot::Ready(conn) = &state.slot else {
            return;
        };
        (self.callbacks.reset)(conn);
        state.slot = Slot::Idle;
        debug!("Connector reset shared connection");
    }

    /// Mark the connector closed and close the current connection
    ///
    /// A dial in progress completes into a closed connector and is torn down
    /// by its owner.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Slot::Ready(conn) = &state.slot {
            (self.callbacks.close)(conn);
            state.slot = Slot::Idle;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Connector<T>
where
    T: Clone + Send + Sync + SameConnection + 'static,
{
    /// Reset only if `failed` is still the installed connection
    ///
    /// Returns `false` when another caller already replaced it.
    pub fn reset_stale(&self, failed: &T) -> bool {
        let mut state = self.lock();
        let Slot::Ready(conn) = &state.slot else {
            return false;
        };
        if !conn.same_connection(failed) {
            return false;
        }
        (self.callbacks.reset)(conn);
        state.slot = Slot::Idle;
        debug!("Connector reset failed shared connection");
        true
    }
}

impl<S> Connector<Arc<Connection<S>>>
where
    S: Send + Sync + 'static,
{
    /// Connector over [`Connection`] values
    ///
    /// Closing records "transport closed" on the connection, resetting records
    /// "connection reset".
    pub fn for_connections(close_ctx: Signal, dial: DialFn<Arc<Connection<S>>>) -> Self {
        Self::new(
            close_ctx,
            dial,
            ConnectorCallbacks {
                is_closed: Box::new(|conn| conn.is_closed()),
                close: Box::new(|conn| {
                    conn.close();
                }),
                reset: Box::new(|conn| {
                    conn.close_with_error(DnsError::ConnectionReset);
                }),
            },
        )
    }
}

impl<T> Debug for Connector<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match state.slot {
            Slot::Idle => "idle",
            Slot::Dialing(_) => "dialing",
            Slot::Ready(_) => "ready",
        };
        f.debug_struct("Connector")
            .field("slot", &slot)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Releases the dialing slot when the dialing caller is cancelled
struct DialGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    connector: &'a Connector<T>,
    episode: &'a Arc<DialEpisode<T>>,
    armed: bool,
}

impl<T> Drop for DialGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.connector.lock();
            if let Slot::Dialing(current) = &state.slot
                && Arc::ptr_eq(current, self.episode)
            {
                state.slot = Slot::Idle;
            }
        }
        self.episode.done.fire();
    }
}

/// I/O handle with a close-once latch and a recorded close reason
pub struct Connection<S> {
    io: S,
    closed: Signal,
    close_error: OnceLock<DnsError>,
}

impl<S> Connection<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            closed: Signal::new(),
            close_error: OnceLock::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.closed.fired().await
    }

    /// Close with a reason; only the first call has any effect
    pub fn close_with_error(&self, err: DnsError) -> bool {
        if self.close_error.set(err).is_err() {
            return false;
        }
        self.closed.fire();
        true
    }

    pub fn close(&self) -> bool {
        self.close_with_error(DnsError::TransportClosed)
    }

    /// The recorded close reason, if the connection has been closed
    pub fn close_error(&self) -> Option<DnsError> {
        self.close_error.get().map(DnsError::replicate)
    }
}

impl<S> Debug for Connection<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("close_error", &self.close_error.get())
            .finish()
    }
}
