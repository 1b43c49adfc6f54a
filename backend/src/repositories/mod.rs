pub mod presence_session;

pub use presence_session::{PgSessionStore, SessionStore};
