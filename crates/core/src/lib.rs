//! Core services for keeping the remote document store and the local
//! relational store in step, and for dispatching push notifications.

pub mod cache;
pub mod errors;
pub mod notifications;
pub mod sync;

pub use errors::{DatabaseError, Error, Result};
