pub mod analysis;
pub mod events;
pub mod instructions;
pub mod knowledge;
pub mod media;
pub mod models;
pub mod session;
