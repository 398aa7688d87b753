//! Crate prelude.

use std::sync::Arc;

pub use crate::config::Config;
pub use crate::error::EngineError;
pub use crate::notify::{Notifier, NotifyLevel, NullNotifier};
pub use crate::trade::{Side, Trade, TradeStatus};

/// Shared notification sink type.
pub type SharedNotifier = Arc<dyn Notifier>;
