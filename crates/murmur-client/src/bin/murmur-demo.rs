//! # murmur-demo
//!
//! Two in-process engines talking through a [`MemoryBackend`]:
//! ana sends "hi" to bea, bea reads it, ana sees the read receipt.
//! Prints each side's final state as JSON.

use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tracing::info;

use murmur_client::{init_tracing, login, ChatEngine, ChatState, EngineConfig, MemoryBackend};
use murmur_store::MemoryStorage;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

async fn wait_until(
    state: &mut watch::Receiver<ChatState>,
    what: &str,
    done: impl FnMut(&ChatState) -> bool,
) -> anyhow::Result<()> {
    match tokio::time::timeout(STEP_TIMEOUT, state.wait_for(done)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => bail!("engine stopped while waiting for {what}"),
        Err(_) => bail!("timed out waiting for {what}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting murmur demo v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    let backend = MemoryBackend::new();

    // -----------------------------------------------------------------------
    // 1. Log both users in
    // -----------------------------------------------------------------------
    let ana_storage = MemoryStorage::new();
    let bea_storage = MemoryStorage::new();
    let ana_session = login(&backend, &ana_storage, "ana", &config)
        .await
        .context("ana login")?;
    let bea_session = login(&backend, &bea_storage, "bea", &config)
        .await
        .context("bea login")?;
    let (ana_id, bea_id) = (ana_session.identity.id, bea_session.identity.id);

    let ana = ChatEngine::spawn(
        ana_session,
        backend.remote(),
        Box::new(ana_storage),
        config.clone(),
    );
    let bea = ChatEngine::spawn(
        bea_session,
        backend.remote(),
        Box::new(bea_storage),
        config.clone(),
    );
    let mut ana_state = ana.subscribe_state();
    let mut bea_state = bea.subscribe_state();

    wait_until(&mut ana_state, "ana's peer list", |s| s.identity(bea_id).is_some()).await?;
    wait_until(&mut bea_state, "bea's peer list", |s| s.identity(ana_id).is_some()).await?;

    // -----------------------------------------------------------------------
    // 2. ana -> bea
    // -----------------------------------------------------------------------
    ana.select_conversation(Some(bea_id)).await;
    ana.set_draft("hi").await;
    ana.send_message().await;
    wait_until(&mut ana_state, "send confirmation", |s| {
        s.pending.is_empty() && s.messages.iter().any(|m| !m.id().is_temporary())
    })
    .await?;

    wait_until(&mut bea_state, "bea's unread count", |s| s.unread_for(ana_id) == 1).await?;
    bea.select_conversation(Some(ana_id)).await;
    wait_until(&mut bea_state, "decrypted message", |s| {
        s.messages.iter().any(|m| m.content.plaintext() == Some("hi"))
    })
    .await?;

    // -----------------------------------------------------------------------
    // 3. Read receipt travels back
    // -----------------------------------------------------------------------
    wait_until(&mut ana_state, "read receipt", |s| {
        s.messages.iter().any(|m| s.is_read(m.id()))
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&ana.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&bea.snapshot())?);

    ana.shutdown().await;
    bea.shutdown().await;
    info!("demo complete");
    Ok(())
}
