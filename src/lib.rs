//! # vecsync
//!
//! Keeps a remote, searchable collection of documents in step with a local
//! directory tree.
//!
//! Every eligible local file is given an identity derived from a namespace
//! key, a SHA-256 fingerprint of its content and its relative path. That
//! identity is the name of the remote object holding the file. Each run
//! compares the local identities with the objects and index memberships that
//! exist remotely, then uploads, links and deletes until both sides agree.
//! Changed content produces a new identity, so stale objects are replaced,
//! never updated in place.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐
//! │ local tree │   │ remote objects │
//! │  (scan)    │   │ + index links  │
//! └─────┬──────┘   └───────┬───────┘
//!       │  LocalSet        │  RemoteSnapshot
//!       └───────┬──────────┘
//!               ▼
//!        ┌─────────────┐       ┌──────────────┐
//!        │  reconcile  │──────▶│   executor   │
//!        │   (pure)    │ Plan  │ delete→create│
//!        └─────────────┘       │  →link-only  │
//!                              └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vecsync scan                    # show the local set, no network
//! vecsync sync --dry-run          # show the plan
//! vecsync sync                    # apply it
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`identity`] | Identity derivation and file eligibility |
//! | [`local_fs`] | Local tree scanning |
//! | [`namespace`] | Namespace key resolution |
//! | [`remote`] | Remote contract and pagination |
//! | [`openai`] | OpenAI Files + Vector Stores backend |
//! | [`memory`] | In-memory backend |
//! | [`index`] | Index resolution |
//! | [`snapshot`] | Remote snapshot reading |
//! | [`reconcile`] | Plan computation |
//! | [`executor`] | Plan execution |
//! | [`progress`] | Progress reporting |
//! | [`sync`] | Command orchestration |

pub mod config;
pub mod executor;
pub mod identity;
pub mod index;
pub mod local_fs;
pub mod memory;
pub mod models;
pub mod namespace;
pub mod openai;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod snapshot;
pub mod sync;
