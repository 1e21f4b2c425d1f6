pub mod config;
pub mod error;
pub mod live;
pub mod server;
pub mod storage;
pub mod tenant;

pub use config::Config;
pub use error::PortalError;
pub use live::{LiveClassManager, LiveSession, LiveSessionHandle, SessionEvent};
pub use server::PortalServer;
pub use storage::{PortalStore, Record, RecordStatus, Subscription};
pub use tenant::SchoolScope;
