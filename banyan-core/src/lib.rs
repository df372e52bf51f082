//! Core protocol types for the Banyan server core.
//!
//! Everything in this crate is pure data: request and response heads,
//! method sets, and the WebSocket frame codec. Sockets, locks, and tasks
//! live in the `banyan` crate.

// ----------

pub use std::error::Error as StdError;

pub(crate) use thiserror::Error as ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub mod frame;
pub mod http;
pub mod request;
pub mod response;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

pub type BoxedError = Box<dyn StdError + Send + Sync>;

// --------------------------------------------------------------------------------
