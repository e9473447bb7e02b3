//! # cport-core: Types and trait definitions for cport
//!
//! cport is an asynchronous I/O completion engine: many in-flight
//! operations are multiplexed through one OS completion queue and their
//! results are delivered, exactly once each, to the callback the caller
//! supplied at submit time.
//!
//! This crate holds everything that does not touch the OS:
//!
//! - [`entry`]: tokens, submission entries, completion records
//! - [`port`]: the `CompletionPort` trait every backend implements
//! - [`address`]: the decoded network address variant
//! - [`error`]: the error taxonomy shared by all cport crates
//! - [`config`], [`env`], [`kprint`]: configuration and logging
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The engine in `cport-module` is generic over [`port::CompletionPort`].
//! io_uring is the default port; swapping it is a type parameter change.

pub mod entry;
pub mod port;
pub mod address;
pub mod error;
pub mod config;
pub mod env;
#[macro_use]
pub mod kprint;
