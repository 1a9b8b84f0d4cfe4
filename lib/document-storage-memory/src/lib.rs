//! In-process engine for document-storage.
//!
//! Interprets query plans directly over JSON documents held in memory. Every
//! operator is supported, including custom predicates, projections,
//! comparers and equalities. Round trips are counted in [`BackendStats`].

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::unwrap_in_result,
        clippy::panic
    )
)]

mod backend;
mod eval;

pub use backend::{BackendStats, MemoryBackend};
