pub mod approto;
pub mod mwproto;

pub use mwproto::client::Client;
pub use mwproto::{Message, WireError};
