pub mod bot;

pub use bot::{Bot, BotStatus, BotUpdate, NewBot};
