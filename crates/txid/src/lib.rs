//! Transaction token generator
//!
//! Every API request must carry an `x-client-transaction-id` header derived
//! from material the service publishes on its web pages: a base64
//! verification key in a meta tag and a set of SVG animation frames, with
//! the frame selection driven by indices found in an on-demand script
//! bundle. This crate fetches and parses that material once per credential
//! and then computes a fresh token per request.
//!
//! Flow:
//! 1. `GeneratorCache::get()` returns the cached generator for a credential,
//!    building one through a `GeneratorSource` on first use
//! 2. `TxIdGenerator::calc()` signs `METHOD!path!` with the current time
//! 3. On a stale-token signal the caller asks for a `fresh` generator

pub mod anim;
pub mod cache;
pub mod constants;
pub mod error;
pub mod generator;
pub mod page;

pub use cache::{GeneratorCache, GeneratorSource, RemoteSource, StaticSource};
pub use constants::{TokenConstants, TokenSource};
pub use error::{Error, Result};
pub use generator::TxIdGenerator;
