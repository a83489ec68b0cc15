//! mudbridge - a browser-to-MUD relay.
//!
//! Each WebSocket push connection gets its own TCP socket to a line-oriented
//! backend. Client commands are forwarded as lines; backend output is turned
//! into HTML markup and pushed back to the browser.

pub mod api;
pub mod backend;
pub mod config;
pub mod format;
pub mod protocol;
pub mod relay;
pub mod scrollback;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tls;
