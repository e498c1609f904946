/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! One-shot broadcast signal
//!
//! A [`Signal`] starts unfired and can be fired exactly once. Any number of
//! tasks can wait on it, before or after it fires, and all of them observe the
//! same transition. It backs the transport close context, the per-connection
//! "closed" notification and the shutdown drain signal.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to a shared one-shot signal
#[derive(Clone)]
pub struct Signal {
    inner: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// Fire the signal
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn fire(&self) -> bool {
        self.inner.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.inner.borrow()
    }

    /// Wait until the signal fires (returns immediately if it already has)
    pub async fn fired(&self) {
        let mut rx = self.inner.subscribe();
        // The sender lives as long as `self`, so wait_for cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}
