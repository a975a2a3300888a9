//! Two sessions annotating one workspace
//!
//! Run with: cargo run --bin marginalia_demo [data_dir]
//! Set RUST_LOG=debug to watch the registry lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use marginalia::convergent::{Anchor, Paragraph, ScalarField, ScalarValue};
use marginalia::{
    Authorization, Document, DocumentRegistry, InMemoryAcl, LocalStore, Operation, Permission,
    PersistenceAdapter, RegistryConfig, SessionHandle, SessionManager, StorageConfig, SyncEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let base_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("marginalia_demo"));
    let store = LocalStore::new(StorageConfig {
        base_dir: base_dir.clone(),
        sync_writes: true,
    })
    .await
    .context("opening blob store")?;
    let store: Arc<dyn PersistenceAdapter> = Arc::new(store);

    let registry = DocumentRegistry::new(Arc::clone(&store), RegistryConfig::default());
    let acl = Arc::new(InMemoryAcl::new());
    let manager = SessionManager::new(registry.clone(), Arc::clone(&acl) as Arc<dyn Authorization>);

    let workspace = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    acl.grant(workspace, alice, Permission::Owner).await;
    acl.grant(workspace, bob, Permission::Peer).await;

    println!("Workspace {} stored under {}", workspace, base_dir.display());

    let mut alice_session = manager.attach(workspace, alice).await?;
    let mut bob_session = manager.attach(workspace, bob).await?;

    let intro = Paragraph::body("Rudd argues that the apology was overdue.");
    let reply = Paragraph::body("The counter-argument rests on the 2008 record.");
    manager
        .submit(
            &alice_session,
            Operation::set_scalar(
                ScalarField::Paragraphs,
                ScalarValue::Paragraphs(vec![intro.clone(), reply.clone()]),
            ),
        )
        .await?;
    manager
        .submit(
            &alice_session,
            Operation::set_scalar(ScalarField::Title, ScalarValue::Text("Apology essay".into())),
        )
        .await?;

    let group = Operation::create_group("Argument", "#3366cc");
    let group_id = group.target_id();
    manager.submit(&alice_session, group).await?;

    // Bob edits through his own replica and ships its deltas
    let mut bob_replica = bob_session.document().fork(Uuid::new_v4());
    catch_up(&mut bob_session, &mut bob_replica).await?;

    let claim = Operation::create_tag("Claim", group_id);
    let claim_id = claim.target_id().context("tag op without id")?;
    let delta = bob_replica.apply_local(claim)?;
    manager.submit_delta(&bob_session, delta).await?;

    let h1 = Operation::add_highlight(Anchor::new(intro.id, 0), Anchor::new(intro.id, 4), claim_id);
    let h1_id = h1.target_id().context("highlight op without id")?;
    let delta = bob_replica.apply_local(h1)?;
    manager.submit_delta(&bob_session, delta).await?;

    let h2 = Operation::add_highlight(Anchor::new(reply.id, 4), Anchor::new(reply.id, 19), claim_id);
    manager.submit(&alice_session, h2).await?;
    manager
        .submit(&alice_session, Operation::remove_highlight(h1_id))
        .await?;
    catch_up(&mut bob_session, &mut bob_replica).await?;

    let alice_events = alice_session.drain().await.len();

    let server = registry
        .snapshot(workspace)
        .await
        .context("workspace not loaded")?;
    println!("Title: {}", server.title);
    println!("Alice has {} deltas from Bob queued", alice_events);
    for highlight in &server.highlights {
        println!(
            "Highlight {} on block {} [{}..{}]",
            highlight.id, highlight.start.block, highlight.start.offset, highlight.end.offset
        );
    }
    for tag in &server.tags {
        println!("Tag #{} {} (group {:?})", tag.order, tag.name, tag.group);
    }
    println!("Paragraph numbers: {:?}", server.paragraph_numbers.values().collect::<Vec<_>>());
    println!(
        "Bob converged with server: {}",
        bob_replica.snapshot() == server
    );

    manager.detach(alice_session).await?;
    manager.detach(bob_session).await?;
    registry.flush(workspace).await?;
    registry.shutdown().await?;

    let blob = store
        .load(workspace)
        .await?
        .context("workspace was not persisted")?;
    println!("Persisted {} bytes", blob.len());
    Ok(())
}

async fn catch_up(session: &mut SessionHandle, replica: &mut Document) -> anyhow::Result<()> {
    for event in session.drain().await {
        match event {
            SyncEvent::Delta(delta) => {
                replica.merge_remote(&delta)?;
            }
            SyncEvent::Resync(document) => *replica = document.fork(replica.replica()),
        }
    }
    Ok(())
}
