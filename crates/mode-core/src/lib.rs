pub mod actions;
pub mod command_rules;
pub mod config;
pub mod menu;
pub mod policy_engine;
pub mod prompt;
pub mod reducer;
pub mod state;
pub mod transcript;

pub use actions::*;
pub use config::*;
pub use reducer::*;
pub use state::*;
pub use transcript::*;
