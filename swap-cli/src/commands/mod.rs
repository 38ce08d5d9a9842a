pub mod abandon;
pub mod demo;
pub mod swaps;

pub use abandon::handle_abandon;
pub use demo::{handle_demo, DemoArgs};
pub use swaps::{handle_list, handle_show};

use anyhow::Context;
use uuid::Uuid;

pub(crate) fn parse_swap_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("'{}' is not a valid swap ID", raw))
}
