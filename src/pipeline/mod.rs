//! Pipeline stages for one relay run.
//!
//! Each submodule implements exactly one step. Stages hand each other plain
//! values ([`upload::StagedInputs`], [`retrieve::ManifestEntry`]) instead of
//! sharing mutable state, so a stage can be tested with nothing but an
//! in-memory object store and a temp dir.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ batch ──▶ retrieve ──▶ … client fetch … ──▶ serve
//! (input     (submit +  (list +                          (read +
//!  bucket)    poll)      download)                        cleanup)
//! ```
//!
//! 1. [`upload`]   : directory marker, then every file concurrently; oversize
//!    files are skipped
//! 2. [`batch`]    : one processor job over the staged keys; skipped entirely
//!    when nothing was staged
//! 3. [`retrieve`] : list the run's output prefix, download into the
//!    processed dir, build the manifest
//! 4. [`serve`]    : read the processed files as text and clear the run's
//!    local and remote temporary state

pub mod batch;
pub mod retrieve;
pub mod serve;
pub mod upload;
