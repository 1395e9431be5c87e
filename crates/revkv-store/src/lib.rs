// ABOUTME: The revkv logical KV store, presenting etcd3-style semantics over the event log.
// ABOUTME: Provides optimistic-concurrency CRUD, prefix listing, watch, and naive TTL expiry.

mod store;
mod ttl;

pub use store::{HEALTH_KEY, LogStructured};
