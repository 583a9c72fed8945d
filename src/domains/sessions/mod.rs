pub mod manager;
pub mod stream;
pub mod watcher;

pub use manager::SessionManager;
pub use stream::{
    FileStreamService, StreamEntry, StreamHeaders, StreamProducer, StreamReader, StreamService,
};
pub use watcher::{DEFAULT_POLL_INTERVAL, ExternalMessageHandler, StreamWatcher};
