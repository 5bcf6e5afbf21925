#![forbid(unsafe_code)]
//! Discrete-event time/clock scheduling kernel for cycle-accurate SoC
//! simulation.
//!
//! # Design
//!
//! The kernel is layered leaf to root:
//!
//! - [`event`]: schedulable units of work, owned by their clock domain's
//!   arena and addressed by validated [`EventId`] handles.
//! - [`clock`]: the per-domain cycle scheduler — a fixed ring for near-horizon
//!   one-shots, a sorted far-horizon list, and a permanently-enabled list
//!   executed once per cycle with per-event stall counts.
//! - [`engine`]: the global picosecond-ordered scheduler of time clients
//!   (clock domains and domain-less time events). It owns simulated time and
//!   drains every client due at an instant before time advances.
//! - [`control`]: the [`Kernel`] handle with the cooperative lock/retain
//!   protocol that lets debuggers, remote-control sessions and co-simulation
//!   bridges pause and resume the engine at timestamp boundaries.
//!
//! The kernel orders and dispatches callbacks in simulated time; it does not
//! interpret instructions, understand wire protocols, or persist state.
//!
//! # Caller contract
//!
//! Event callbacks run with the engine's state borrowed. They may schedule
//! freely through their [`ClockContext`]/[`TimeContext`], but must never call
//! the blocking control API (`lock`, `stop`, `step`, `join`, ...): the engine
//! would deadlock against itself. This is documented, not enforced.

pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod event;

pub use clock::{ClockContext, ClockEngine, RING_SIZE};
pub use config::{ConfigError, DomainConfig, KernelConfig};
pub use control::{ControlError, EngineObserver, Kernel, KernelGuard};
pub use engine::{ClientId, RunState, TimeContext, TimeEngine, TimeFn};
pub use event::{EventFn, EventId};
