//! Caching client for the Cijene grocery price comparison API.
//!
//! [`cache::QueryClient`] is a cache-first query layer with request
//! deduplication, stale-while-revalidate, retries, garbage collection and
//! refresh on focus/reconnect. [`api::CachedApiClient`] puts the price API
//! behind it, using the hierarchical keys from [`keys`] and query strings
//! built by [`params::ParamsBuilder`].

pub mod api;
pub mod cache;
pub mod config;
pub mod event;
pub mod keys;
pub mod params;
pub mod query;
