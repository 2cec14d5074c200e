pub mod game;
pub mod requests;
pub mod summary;
pub mod timestamp;
pub mod ws;
