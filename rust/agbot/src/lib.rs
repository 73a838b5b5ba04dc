/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! The consumer side of workload agreement negotiation: a reactive
//! handler that re-evaluates in-flight agreements as policies change,
//! coordinates HA rolling upgrades across agbot instances, and drives the
//! proposal/reply/cancel exchange through a prioritized worker pool.
//!
//! External events enter as typed [`commands::Command`]s; everything the
//! engine needs from the outside world (exchange, datastore, object
//! store, secrets, node search) is a capability interface.

#![allow(clippy::module_name_repetitions)]

pub mod commands;
pub mod compat;
pub mod exchange;
pub mod handler;
pub mod lifecycle;
pub mod objects;
pub mod policy;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod work;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum AgbotError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transient transport error: {0}")]
    TransportTransient(String),
    #[error("transport error: {0}")]
    TransportFatal(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("ignored: {0}")]
    Ignored(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("secrets error: {0}")]
    Secrets(#[from] covenant_secrets::SecretsError),
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl AgbotError {
    /// Worth retrying after a backoff; everything else is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportTransient(_))
    }
}
