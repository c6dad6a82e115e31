//! Portico core library: the agent gateway, its built-in capabilities, and the
//! collaborators they use (conversation memory and the model portal).

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod memory;
pub mod portal;
