//! Pipeline stages for a single page image.
//!
//! Each submodule implements exactly one step; [`task`] strings them together
//! into the per-image state machine the dispatcher schedules.
//!
//! ## Data Flow
//!
//! ```text
//! path ──▶ cache ──(miss)──▶ fetch ──▶ classify ──▶ transform ──▶ cache
//! (URL)   (probe)            (HTTP)    (h/w>1.6)    (trim+WebP)   (persist)
//! ```
//!
//! 1. [`path`]      — map a source URL or chapter/filename pair onto a
//!    collision-free, escaped cache path and public URL; pure, no I/O
//! 2. [`cache`]     — existence probe, metadata records, atomic persist,
//!    served-artifact lookup
//! 3. [`fetch`]     — GET with a same-origin `Referer`; the only stage with
//!    network I/O
//! 4. [`classify`]  — webtoon vs. paged by aspect ratio
//! 5. [`transform`] — trim white margins and re-encode paged images; runs in
//!    `spawn_blocking` because decoding and WebP encoding are CPU-bound
//! 6. [`task`]      — the state machine tying the above together

pub mod cache;
pub mod classify;
pub mod fetch;
pub mod path;
pub mod task;
pub mod transform;
