pub mod mix;
pub mod room;
pub mod session;

pub use room::Rooms;
pub use session::serve;
