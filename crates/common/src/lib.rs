//! Shared wire and configuration types for the erasure-coded object
//! reconstructor: the placement-ring device record, the storage policy
//! description, the suffix-hash manifest key type, peer wire header
//! names, and the on-disk daemon configuration.

pub mod config;
pub mod device;
pub mod policy;
pub mod suffix_key;
pub mod wire;

pub use config::ReconstructorConfig;
pub use device::DeviceRecord;
pub use policy::StoragePolicy;
pub use suffix_key::SuffixKey;
