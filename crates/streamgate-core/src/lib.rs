pub mod acquirer;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod packager;
pub mod paths;
pub mod registry;
pub mod selection;
pub mod sniff;

pub use acquirer::Acquirer;
pub use config::{Config, Profile};
pub use coordinator::StreamCoordinator;
pub use engine::{EngineConfig, LibrqbitEngine, RunningTorrent, SwarmStats, TorrentEngine};
pub use error::{Error, Result};
pub use packager::{HlsPackager, PackagerMode};
pub use paths::PathService;
pub use registry::{Registry, RegistryStats, Stream, StreamStatus};
pub use selection::{CandidateFile, select_video_file};
pub use sniff::{Container, sniff_container};
