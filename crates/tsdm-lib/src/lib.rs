pub mod chronology;
pub mod clock;
pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod executor;
pub mod io;
pub mod manager;
pub mod merge;
pub mod registry;
pub mod scheduler;
pub mod window;

pub use chronology::*;
pub use clock::*;
pub use config::{parse_config, read_config, ManagerConfig, Retention};
pub use dataset::*;
pub use error::{Result, SyncError};
pub use events::*;
pub use executor::*;
pub use manager::*;
pub use merge::{merge, MergeOutcome};
pub use registry::*;
pub use scheduler::*;
pub use window::*;
