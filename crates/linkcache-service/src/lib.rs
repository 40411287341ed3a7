//! The core of linkcache: a request-coalescing loading cache, a periodically refreshed lookup
//! table, and the two upstream resolvers (thumbnails and emote sets) built on top of them.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod emotes;
pub mod refresh;
pub mod responses;
pub mod services;
pub mod thumbnails;
pub mod utils;
