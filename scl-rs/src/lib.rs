//! Step-tree interpreter for SCL.
//!
//! A script arrives as an untyped [`freeze::FreezableStep`] tree.  The
//! [`freeze::StepFactoryStore`] type-checks it and builds an
//! [`step::ExecutableStep`], which runs against a [`scope::Scope`] with a
//! [`context::RunContext`].  [`engine::Engine`] wraps the whole sequence for
//! hosts.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod freeze;
pub mod scope;
pub mod serialize;
pub mod step;
pub mod steps;
pub mod types;
pub mod value;
