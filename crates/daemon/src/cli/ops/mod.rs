pub mod compact;
pub mod recent;
pub mod serve;
pub mod stores;
pub mod version;

pub use compact::Compact;
pub use recent::Recent;
pub use serve::Serve;
pub use stores::Stores;
pub use version::Version;
