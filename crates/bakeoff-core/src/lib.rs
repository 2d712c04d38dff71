//! Token pipeline logic and trait seams for bakeoff.
//!
//! This crate holds everything between "a validated prompt has arrived" and
//! "every token has been durably recorded or safely deferred": provider
//! safety (circuit breaker + concurrency gate + retry envelope), the token
//! build/buffer path with back-pressure, the fallback policy, and the
//! per-request orchestrator.
//!
//! IO lives behind trait seams ([`persistence::PersistenceBackend`],
//! [`repository`], [`provider::ProviderAdaptor`]) implemented in
//! `bakeoff-infra` -- this crate depends only on `bakeoff-types`.

pub mod breaker;
pub mod buffer;
pub mod builder;
pub mod fallback;
pub mod gate;
pub mod persistence;
pub mod pipeline;
pub mod provider;
pub mod repository;
pub mod safe_call;
