pub mod presence;
pub mod presence_ws;
