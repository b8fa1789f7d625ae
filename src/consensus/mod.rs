// Rabia consensus: randomized binary agreement over command batches.

pub mod engine;
pub mod log;
pub mod machine;
pub mod types;

pub(crate) mod recovery;
pub(crate) mod state;

pub use engine::{spawn_engine, EngineHandle, EngineStatsSnapshot, Outbound, ENGINE_ROUTES};
pub use log::CommittedLog;
pub use machine::{KvCommand, KvStore, StateMachine};
pub use types::{coin, Batch, Command, Fingerprint, Phase, Phase2Value, Round, VoteValue};
