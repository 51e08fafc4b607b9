//! The zio pipeline.
//!
//! | Module      | Role                                                   |
//! |-------------|--------------------------------------------------------|
//! | `types`     | kinds, priorities, flags, stages and pipelines         |
//! | `request`   | the request record and its two locks                   |
//! | `construct` | per-kind constructors and child creation               |
//! | `graph`     | parent/child edges and pending counters                |
//! | `executor`  | the stage driver, worklist and submission              |
//! | `stages`    | the stage functions                                    |
//! | `transform` | reversible buffer substitutions                        |
//! | `gang`      | gang block assembly and issue                          |
//! | `throttle`  | allocation admission control                           |
//! | `ddt`       | dedup stages                                           |
//! | `suspend`   | pool suspension and reexecution                        |
//! | `deadman`   | hung I/O detection                                     |
//! | `taskq`     | worker queues                                          |

pub(crate) mod arena;
pub(crate) mod construct;
pub(crate) mod ddt;
pub(crate) mod deadman;
pub(crate) mod executor;
pub(crate) mod gang;
pub(crate) mod graph;
pub(crate) mod request;
pub(crate) mod stages;
pub(crate) mod suspend;
pub(crate) mod taskq;
pub(crate) mod throttle;
pub(crate) mod transform;
pub mod types;

pub use arena::ZioId;
pub use deadman::SlowIo;
pub use executor::IoCompletion;
pub use request::{ActiveZio, Completed, UserCallback, ZioView};
pub use suspend::{PoolEvent, PoolIoState};
pub use taskq::TaskqTier;
pub use types::{
    ChildType, IoctlCmd, LifecycleEvent, Priority, RequestState, Stage, StageMask, ZioFlags,
    ZioType,
};
