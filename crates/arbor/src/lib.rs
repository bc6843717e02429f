#![forbid(unsafe_code)]

//! Arbor public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub mod prelude {
    pub use arbor_core as core;
    pub use arbor_runtime as runtime;

    pub use arbor_core::{Event, EventKind, Graph, GraphError, NodeId, Value};
    pub use arbor_runtime::{
        bind, bind_from, Activity, Deferred, HookKind, HookTable, LabClock, QueueOptions,
        Scheduler,
    };
}
