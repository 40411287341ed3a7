//! An in-memory loading cache.
//!
//! A [`LoadingCache`] computes its values on demand through a [`Loader`]. Concurrent requests for
//! the same key are coalesced into a single computation, and values expire lazily once their
//! time-to-live has passed. Loaders report a [`LoadOutcome`], which distinguishes real values
//! from cacheable negative results and from failures that must not be cached at all.

mod loading;
mod outcome;

pub use loading::*;
pub use outcome::*;

#[cfg(test)]
mod tests;
