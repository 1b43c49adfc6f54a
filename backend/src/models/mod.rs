pub mod presence_session;
