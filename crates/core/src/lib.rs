pub mod ec_codec;
pub mod executor;
pub mod fragment_store;
pub mod job;
pub mod peer_control;
pub mod peer_sync;
pub mod planner;
pub mod reconstructor_loop;
pub mod rebuilder;
pub mod ring;
pub mod scanner;
pub mod stats;

pub use ec_codec::{EcCodec, EcCodecError, ReedSolomonCodec};
pub use executor::{ExecuteError, JobExecutor, JobOutcome, JobState};
pub use fragment_store::{FragmentStore, FragmentStoreError, LocalFragmentStore};
pub use job::{AvailableMap, Job, JobKind};
pub use peer_control::{HttpPeerControl, PeerControl, PeerError};
pub use peer_sync::{HttpPeerSync, PeerSync, PeerSyncError};
pub use planner::{JobPlanner, PlannerError};
pub use reconstructor_loop::{PassOutcome, ReconstructorLoop, ReconstructorLoopError};
pub use rebuilder::{FragmentResponse, HandoffFragmentMap, RebuildError, Rebuilder, RebuiltFragment};
pub use ring::{FileRingView, RingError, RingView};
pub use scanner::{PartInfo, PartitionScanner};
pub use stats::{PassStats, PassStatsSnapshot};
