pub mod net;
pub mod room;
pub mod time;
