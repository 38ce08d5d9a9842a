use super::parse_swap_id;
use comfy_table::{presets::UTF8_FULL, Table};
use swap_core::{FlowRecord, FlowState, SwapManager};

pub async fn handle_list(manager: &SwapManager) -> anyhow::Result<()> {
    let records = manager.list().await?;

    if records.is_empty() {
        println!("No swaps found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Role", "Step", "Version", "Status", "Updated"]);

    for record in &records {
        table.add_row(vec![
            record.swap_id.to_string(),
            record.kind.to_string(),
            record.current_step().to_string(),
            record.state.version.to_string(),
            status(record).to_string(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub async fn handle_show(manager: &SwapManager, swap_id: &str) -> anyhow::Result<()> {
    let record = manager.record(parse_swap_id(swap_id)?).await?;

    println!("Swap {} ({})", record.swap_id, record.kind);
    println!("  Step: {} ({})", record.current_step(), status(&record));
    println!();
    println!("{}", serde_json::to_string_pretty(&redacted(&record.state)?)?);
    Ok(())
}

/// The state as JSON with the preimage masked. Its hash stays visible.
fn redacted(state: &FlowState) -> serde_json::Result<serde_json::Value> {
    let mut json = serde_json::to_value(state)?;
    if let Some(secret) = json.get_mut("secret").filter(|v| !v.is_null()) {
        *secret = serde_json::Value::String("<redacted>".to_string());
    }
    Ok(json)
}

pub(crate) fn status(record: &FlowRecord) -> &'static str {
    let state = &record.state;
    if state.is_finished {
        "finished"
    } else if state.is_refunded {
        "refunded"
    } else if state.is_utxo_script_funded || state.is_account_script_funded {
        "locked"
    } else {
        "open"
    }
}
