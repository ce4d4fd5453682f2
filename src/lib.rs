//! Device-side command protocol engine for a USB-serial flux controller,
//! with a host client to drive it.

pub mod drive;
pub mod engine;
pub mod flux;
pub mod host;
pub mod port;
pub mod proto;
pub mod state;
pub mod stats;
pub mod transport;
