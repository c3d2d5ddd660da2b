pub mod id;
pub mod protocol;
pub mod room;
pub mod snowflake;

pub use protocol::Frame;
pub use room::{RoomKind, RoomName};
pub use snowflake::SnowflakeGenerator;
