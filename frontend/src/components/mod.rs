pub mod presence_badge;
