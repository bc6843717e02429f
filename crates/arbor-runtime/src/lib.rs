#![forbid(unsafe_code)]

//! Runtime: path bindings, cooperative task scheduling, and the activation
//! state machine, layered on `arbor-core`.

pub mod activation;
pub mod binding;
pub mod deferred;
pub mod scheduler;

pub use activation::{ActivationError, Activity, HookKind, HookTable};
pub use binding::{bind, bind_from, BindingSpec, BoundValue, CompositeBinding, CompositeBound};
pub use deferred::Deferred;
pub use scheduler::{LabClock, QueueOptions, QueueState, Scheduler, TaskFailure, TaskHandle, TaskQueue};
