//! Runtime patches and shared map state for a multiplayer game server mod.
//!
//! The `hook` module finds operations in the host by signature and changes them, either by
//! wrapping calls (before, after, replace) or by rewriting their bodies. Patches are declared
//! once in a registry and applied, removed and re-applied as the configuration changes, for
//! example when a client joins a server and takes on the server's configuration.
//!
//! The `sync` module keeps map pins and explored areas consistent between the server and its
//! clients over the host's routed RPC mechanism.
//!
//! `runtime::Runtime` ties everything together behind one entry point per host event.

pub mod chain;
pub mod game;
pub mod hook;
pub mod logging;
pub mod runtime;
pub mod settings;
pub mod sync;
pub mod throttle;
pub mod vector;

pub use runtime::{Options, Runtime};
pub use settings::{ConfigSource, Configuration, Snapshot};
