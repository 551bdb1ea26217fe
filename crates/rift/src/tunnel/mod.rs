//! Reverse tunnel client: one session attempt binds one relay-side listener
//! and relays every connection accepted there to one target.

pub mod control;
pub mod dial;
pub mod error;
pub mod relay;
pub mod secure;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;
