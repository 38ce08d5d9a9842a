use super::{parse_swap_id, swaps::status};
use swap_core::SwapManager;

pub async fn handle_abandon(manager: &SwapManager, swap_id: &str, force: bool) -> anyhow::Result<()> {
    let swap_id = parse_swap_id(swap_id)?;
    let record = manager.record(swap_id).await?;

    if status(&record) == "locked" && !force {
        println!("Swap {} still has funds locked on chain.", swap_id);
        println!("Refund them first, or pass --force to forget the swap anyway.");
        return Ok(());
    }

    manager.abandon(swap_id).await?;
    println!("Swap {} abandoned", swap_id);
    Ok(())
}
