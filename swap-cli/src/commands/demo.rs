use crate::config::CliConfig;
use anyhow::{bail, Context};
use bitcoin::Amount;
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};
use std::sync::Arc;
use std::time::Duration;
use swap_core::{
    ChainAccount, FlowEvent, LocalRoom, MemoryLedger, PartyKeys, Room, SwapContext, SwapFlow,
    SwapManager,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Args)]
pub struct DemoArgs {
    /// Satoshis the owner locks on the UTXO chain
    #[arg(long, default_value_t = 150_000_000)]
    sell: u64,
    /// Units the owner buys on the account chain
    #[arg(long, default_value_t = 1_000_000)]
    buy: u64,
    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

fn alice() -> PartyKeys {
    PartyKeys {
        utxo: ChainAccount::new("alice-btc", "alice-btc-pk"),
        account: ChainAccount::new("alice-point", "alice-point-pk"),
    }
}

fn bob() -> PartyKeys {
    PartyKeys {
        utxo: ChainAccount::new("bob-btc", "bob-btc-pk"),
        account: ChainAccount::new("bob-point", "bob-point-pk"),
    }
}

/// Alice owns the swap and sells `sell` sats; Bob takes it and sells `buy`
/// account units. Each side persists under its own directory.
pub async fn handle_demo(args: DemoArgs, config: &CliConfig) -> anyhow::Result<()> {
    let sell = Amount::from_sat(args.sell);
    let buy = Amount::from_sat(args.buy);
    let swap_id = Uuid::new_v4();

    let (alice_keys, bob_keys) = (alice(), bob());
    let alice_utxo = MemoryLedger::new(&alice_keys.utxo.address, &alice_keys.utxo.public_key);
    let alice_account =
        MemoryLedger::new(&alice_keys.account.address, &alice_keys.account.public_key);
    let bob_utxo = alice_utxo.wallet(&bob_keys.utxo.address, &bob_keys.utxo.public_key);
    let bob_account = alice_account.wallet(&bob_keys.account.address, &bob_keys.account.public_key);
    alice_utxo.deposit(&alice_keys.utxo.address, sell);
    bob_account.deposit(&bob_keys.account.address, buy);

    let owner_context = SwapContext::builder(swap_id)
        .amounts(sell, buy)
        .local(alice_keys.clone())
        .counterparty(bob_keys.clone())
        .utxo_ledger(Arc::new(alice_utxo.clone()))
        .account_ledger(Arc::new(alice_account.clone()))
        .build()?;
    let participant_context = SwapContext::builder(swap_id)
        .amounts(buy, sell)
        .local(bob_keys.clone())
        .counterparty(alice_keys.clone())
        .utxo_ledger(Arc::new(bob_utxo))
        .account_ledger(Arc::new(bob_account))
        .build()?;

    let mut flow_config = config.flow.clone();
    flow_config.poll_interval = flow_config.poll_interval.min(Duration::from_millis(200));
    flow_config.auto_secret = true;

    let demo_dir = config.data_dir.join("demo");
    let owner_dir = demo_dir.join("owner");
    let participant_dir = demo_dir.join("participant");
    tokio::fs::create_dir_all(&owner_dir).await?;
    tokio::fs::create_dir_all(&participant_dir).await?;
    let owner_manager = SwapManager::with_config(&owner_dir, flow_config.clone()).await?;
    let participant_manager = SwapManager::with_config(&participant_dir, flow_config).await?;

    let (owner_room, participant_room) = LocalRoom::pair();
    let owner_room: Arc<dyn Room> = Arc::new(owner_room);
    let participant_room: Arc<dyn Room> = Arc::new(participant_room);

    let owner = owner_manager.open_owner(owner_context, owner_room).await?;
    let participant = participant_manager
        .open_participant(participant_context, participant_room)
        .await?;

    println!("Swap {}", swap_id);
    println!(
        "  Alice sells {} sats for {} account units",
        sell.to_sat(),
        buy.to_sat()
    );
    println!();

    let printers = [
        print_events("owner", owner.events()),
        print_events("participant", participant.events()),
    ];

    let owner_run = {
        let owner = owner.clone();
        tokio::spawn(async move { owner.run().await })
    };
    let participant_run = {
        let participant = participant.clone();
        tokio::spawn(async move { participant.run().await })
    };

    if !participant.sign().await? {
        owner_run.abort();
        participant_run.abort();
        bail!("Bob refused to sign: an earlier swap with Alice is still open");
    }

    let finished = tokio::time::timeout(Duration::from_secs(args.timeout), async {
        let (owner_result, participant_result) = tokio::join!(owner_run, participant_run);
        owner_result.context("Owner flow panicked")??;
        participant_result.context("Participant flow panicked")??;
        anyhow::Ok(())
    })
    .await;

    for printer in printers {
        printer.abort();
    }
    match finished {
        Ok(result) => result?,
        Err(_) => bail!(
            "Swap {} did not finish within {}s; records kept under {}",
            swap_id,
            args.timeout,
            demo_dir.display()
        ),
    }

    println!();
    println!("Swap finished");

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Party", "UTXO chain (sats)", "Account chain (units)"]);
    table.add_row(vec![
        "Alice".to_string(),
        alice_utxo.balance_of(&alice_keys.utxo.address).to_sat().to_string(),
        alice_account.balance_of(&alice_keys.account.address).to_sat().to_string(),
    ]);
    table.add_row(vec![
        "Bob".to_string(),
        alice_utxo.balance_of(&bob_keys.utxo.address).to_sat().to_string(),
        alice_account.balance_of(&bob_keys.account.address).to_sat().to_string(),
    ]);
    println!("{}", table);

    let owner_state = owner.state().await;
    let participant_state = participant.state().await;
    println!("Owner withdraw tx: {:?}", owner_state.account_withdraw_tx);
    println!("Participant withdraw tx: {:?}", participant_state.utxo_withdraw_tx);
    println!(
        "Records kept under {} and {}",
        owner_dir.display(),
        participant_dir.display()
    );
    Ok(())
}

fn print_events(side: &'static str, mut events: broadcast::Receiver<FlowEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FlowEvent::StepChanged { index, step }) => {
                    println!("[{}] step {} -> {}", side, index, step);
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => println!("[{}] {}", side, json),
                    Err(e) => tracing::debug!("Unprintable event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("{} event printer skipped {} events", side, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
