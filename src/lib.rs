//! # repo-index
//!
//! Content-addressed indexing of git repositories into an
//! Elasticsearch-compatible search backend, with search and suggest scoped
//! to the repositories a caller is allowed to read.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │  Repository  │──▶│   Reindex    │──▶│  Extract  │──▶│ Indexer  │──▶ backend
//! │    store     │   │ orchestrator │   │ text/pdf/ │   │ (upsert) │
//! └──────────────┘   └──────┬───────┘   │   nev     │   └──────────┘
//!                           │           └───────────┘
//!                    ┌──────▼───────┐
//!                    │  Permission  │◀── access-control service
//!                    │   resolver   │
//!                    └──────▲───────┘
//!                           │
//!                    ┌──────┴───────┐
//!                    │ Query gateway│──▶ backend (filtered by repositoryID)
//!                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`identity`] | Namespaced document identities |
//! | [`extract`] | Plain text, PDF and fixed-header text extraction |
//! | [`git`] | Bounded reads from git object stores |
//! | [`access`] | Access-control client and permitted repository sets |
//! | [`enumerate`] | Lazy discovery of authorized repositories |
//! | [`backend`] | Search backend client |
//! | [`indexer`] | Document construction and submission |
//! | [`reindex`] | Reindex passes with worker pool and deadline |
//! | [`query`] | Scoped search and suggest |
//! | [`server`] | HTTP API |

pub mod access;
pub mod backend;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod extract;
pub mod git;
pub mod identity;
pub mod indexer;
pub mod models;
pub mod query;
pub mod reindex;
pub mod server;
