// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchid Core - Multi-Tenant Orchestration Control Plane
//!
//! This crate is the control plane of an infrastructure orchestrator: it
//! accepts administrative actions against VMs, hosts, clusters, datastores
//! and networks, and applies each one only if the caller is authorized,
//! sufficient quota exists, and the target resources are structurally
//! compatible.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Front ends (RPC server, CLI)                        │
//! │                          (orchid-api types)                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Action Orchestrator                            │
//! │      (dispatch: deploy / migrate / action / disks / clusters)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                │                 │                    │
//!        ▼                ▼                 ▼                    ▼
//! ┌────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐
//! │   Auth     │  │ Quota Ledger │  │ Object Pools │  │ Cluster Resources│
//! │ Evaluator  │  │ (+rollback)  │  │ (lock table) │  │  (VNC bitmaps)   │
//! └─────┬──────┘  └──────────────┘  └──────┬───────┘  └──────────────────┘
//!       │                                  │
//!       ▼                                  ▼
//! ┌────────────┐                    ┌──────────────┐
//! │ ACL/Auth   │                    │    Store     │
//! │  drivers   │                    │   (SQLite)   │
//! └────────────┘                    └──────────────┘
//! ```
//!
//! # Action workflow
//!
//! Every operation follows the same sequence:
//!
//! | Step | What happens |
//! |------|--------------|
//! | 1 | Resolve the caller session to an identity |
//! | 2 | Shared-fetch the target, capture a permission snapshot |
//! | 3 | Reject actions unsupported for imported VMs |
//! | 4 | Evaluate authorization, one clause per sub-resource |
//! | 5 | Reserve quota against the *owner*, in fixed order |
//! | 6 | Validate placement (capacity, datastore, VNC ports) |
//! | 7 | Mutate under the exclusive accessor, persist |
//! | 8 | On failure after 5: compensate in reverse order |
//!
//! Reservations committed before a later failure are rolled back inline,
//! before the failure is returned; callers never observe a
//! partially-charged, failed action.
//!
//! # Concurrency
//!
//! All object mutation funnels through a per-object lock held by the
//! exclusive pool accessor until the guard leaves scope. Shared fetches
//! return committed snapshot copies and never block behind a held object
//! lock. Driver round-trips (authentication, ACL) run under a queued
//! request scheme matched by request id - never while an object lock is
//! held.
//!
//! # Modules
//!
//! - [`config`]: configuration from `ORCHID_*` environment variables
//! - [`context`]: the explicit dependency context passed to every handler
//! - [`auth`]: authorization evaluator, session resolution, driver boundary
//! - [`quota`]: the quota ledger and the ordered reservation log
//! - [`objects`]: the managed-object model (VM, host, cluster, ...)
//! - [`pool`]: typed, lock-aware pool accessors
//! - [`store`]: the persistence boundary (SQLite or in-memory)
//! - [`dispatch`]: the per-action orchestration workflows
//! - [`error`]: error types mapping to the caller-visible code taxonomy

#![deny(missing_docs)]

/// Authorization evaluator, session resolution and the driver boundary.
pub mod auth;

/// Configuration loaded from environment variables.
pub mod config;

/// The explicit dependency context.
pub mod context;

/// Per-action orchestration workflows.
pub mod dispatch;

/// Error types with caller-visible code mapping.
pub mod error;

/// The managed-object model.
pub mod objects;

/// Typed, lock-aware object pools.
pub mod pool;

/// The quota ledger and reservation log.
pub mod quota;

/// The persistence boundary.
pub mod store;

pub use config::Config;
pub use context::Context;
pub use error::{CoreError, Result};
