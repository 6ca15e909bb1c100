pub mod chat;
pub mod errors;
pub mod events;
pub mod handles;
pub mod prompts;
pub mod runs;
pub mod styles;
