#[macro_use]
extern crate serde;

#[macro_use]
extern crate log;

mod authority;
mod blind;
mod config;
mod election;
mod error;
mod event;
mod nonce;
mod relay;
mod serde_b64;
mod session;
mod store;
mod sync;
mod tally;
mod transport;
mod util;
mod voting;
mod vote;

pub use authority::*;
pub use blind::*;
pub use config::*;
pub use election::*;
pub use error::*;
pub use event::*;
pub use nonce::*;
pub use relay::*;
pub use serde_b64::*;
pub use session::*;
pub use store::*;
pub use sync::*;
pub use tally::*;
pub use transport::*;
pub use util::*;
pub use voting::*;
pub use vote::*;
