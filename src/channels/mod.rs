//! Provider plumbing: the traits the engine talks through, and the Telegram provider.

pub mod provider;
pub mod telegram;

pub use provider::*;
pub use telegram::TelegramProvider;
