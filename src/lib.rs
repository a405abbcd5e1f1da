//! Find Docker images in a Nexus repository and reduce their tags to the set
//! worth retaining: the newest numeric versions plus `latest` while it still
//! points at the newest one.

mod nexus;
mod retain;

pub use nexus::{Credentials, Nexus, SearchMode};
pub use retain::{
    ImageRecord, LATEST, LatestPolicy, NumericVersion, RetentionPolicy, group, numeric_version,
    reduce,
};
