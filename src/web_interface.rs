// Live feed module root
pub mod feed;
pub mod routes;
pub mod types;
pub mod web_server;

// Re-export commonly used items
pub use feed::LiveFeed;
pub use routes::{routes, FeedState};
pub use types::ControlCommand;
pub use web_server::WebServer;
