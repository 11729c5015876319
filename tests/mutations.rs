use anyhow::Result;
use rillview::{
    Entity, EntityProvider, Error, MemoryStore, PersistenceSession, ProviderConfig,
    testing::{memory_provider, seed},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
#[entity(name = "account")]
struct Account {
    id: i64,
    owner: String,
    credit: i64,
}

fn account(id: i64, owner: &str, credit: i64) -> Account {
    Account {
        id,
        owner: owner.into(),
        credit,
    }
}

#[tokio::test]
async fn crud_round_trip() -> Result<()> {
    let store = MemoryStore::new();
    let mut provider = memory_provider::<Account>(&store, true)?;

    let added = provider.add_entity(account(1, "ann", 10)).await?;
    assert_eq!(added, account(1, "ann", 10));
    provider.add_entity(account(2, "ben", 20)).await?;
    assert_eq!(provider.get_entity_count(None).await?, 2);

    let updated = provider.update_entity(account(1, "ann", 15)).await?;
    assert_eq!(updated.credit, 15);
    assert_eq!(store.document("account", &json!(1)).unwrap()["credit"], json!(15));

    provider.update_entity_property(&2, "owner", json!("bea")).await?;
    assert_eq!(provider.get_entity(&2).await?.unwrap().owner, "bea");

    provider.remove_entity(&1).await?;
    assert_eq!(provider.get_entity(&1).await?, None);
    assert_eq!(store.row_count("account"), 1);
    Ok(())
}

#[tokio::test]
async fn update_of_unknown_identifier_inserts() -> Result<()> {
    let store = MemoryStore::new();
    let mut provider = memory_provider::<Account>(&store, false)?;
    provider.update_entity(account(9, "zed", 0)).await?;
    assert_eq!(store.row_count("account"), 1);
    Ok(())
}

#[tokio::test]
async fn missing_targets_are_ignored() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, true)?;

    provider.remove_entity(&42).await?;
    provider.update_entity_property(&42, "credit", json!(1)).await?;
    assert_eq!(store.row_count("account"), 1);
    assert!(!provider.session().is_active());
    Ok(())
}

#[tokio::test]
async fn property_updates_are_checked() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, true)?;

    let err = provider
        .update_entity_property(&1, "colour", json!("red"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownProperty { ref property, .. } if property == "colour"));

    let err = provider
        .update_entity_property(&1, "credit", json!("lots"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Serde(_)));
    assert!(!provider.session().is_active());
    assert_eq!(store.document("account", &json!(1)).unwrap()["credit"], json!(10));
    Ok(())
}

#[tokio::test]
async fn failing_write_rolls_back_handled_transaction() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10), account(2, "ben", 20)]).await?;
    let mut provider = memory_provider::<Account>(&store, true)?;
    let before = provider.get_entity_count(None).await?;

    store.fail_writes_after(0);
    let err = provider.add_entity(account(3, "cat", 30)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    store.clear_fault();

    assert_eq!(provider.get_entity_count(None).await?, before);
    assert!(!provider.session().is_active());
    Ok(())
}

#[tokio::test]
async fn partial_flush_is_discarded_by_rollback() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, true)?;

    // dirty a managed instance so the next flush writes it before the insert
    assert!(provider.session_mut().load(&json!(1)).await?);
    provider.session_mut().managed_mut(&json!(1)).unwrap().credit = 99;

    store.fail_writes_after(1);
    let err = provider.add_entity(account(2, "ben", 20)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    store.clear_fault();

    assert_eq!(store.row_count("account"), 1);
    assert_eq!(store.document("account", &json!(1)).unwrap()["credit"], json!(10));
    assert_eq!(provider.get_entity(&1).await?.unwrap().credit, 10);
    Ok(())
}

#[tokio::test]
async fn caller_owned_transactions_keep_partial_writes() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, false)?;

    assert!(provider.session_mut().load(&json!(1)).await?);
    provider.session_mut().managed_mut(&json!(1)).unwrap().credit = 99;

    store.fail_writes_after(1);
    let err = provider.add_entity(account(2, "ben", 20)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    store.clear_fault();

    assert_eq!(store.row_count("account"), 1);
    assert_eq!(store.document("account", &json!(1)).unwrap()["credit"], json!(99));
    Ok(())
}

#[tokio::test]
async fn caller_transaction_commits_all_mutations_together() -> Result<()> {
    let store = MemoryStore::new();
    let mut provider = memory_provider::<Account>(&store, false)?;

    provider.session_mut().begin().await?;
    provider.add_entity(account(1, "ann", 10)).await?;
    provider.add_entity(account(2, "ben", 20)).await?;
    assert_eq!(store.row_count("account"), 0);
    assert_eq!(provider.get_entity_count(None).await?, 2);
    provider.session_mut().commit().await?;
    assert_eq!(store.row_count("account"), 2);
    Ok(())
}

#[tokio::test]
async fn handled_transactions_refuse_to_nest() -> Result<()> {
    let store = MemoryStore::new();
    let mut provider = memory_provider::<Account>(&store, true)?;

    provider.session_mut().begin().await?;
    let err = provider.add_entity(account(1, "ann", 10)).await.unwrap_err();
    assert!(matches!(err, Error::TransactionState(_)));
    assert!(provider.session().is_active());
    provider.session_mut().rollback().await?;
    assert_eq!(store.row_count("account"), 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_insert_fails_without_side_effects() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, true)?;

    let err = provider.add_entity(account(1, "imposter", 0)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(provider.get_entity(&1).await?.unwrap().owner, "ann");
    Ok(())
}

#[tokio::test]
async fn rejected_write_leaves_the_session_usable() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, false)?;

    let err = provider.add_entity(account(1, "imposter", 0)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert!(provider.session().managed(&json!(1)).is_none());
    assert_eq!(provider.get_entity(&1).await?.unwrap().owner, "ann");

    provider.add_entity(account(2, "ben", 20)).await?;
    assert_eq!(store.row_count("account"), 2);
    assert_eq!(store.document("account", &json!(1)).unwrap()["owner"], json!("ann"));
    Ok(())
}

#[tokio::test]
async fn failed_update_does_not_linger_in_the_session() -> Result<()> {
    let store = MemoryStore::new();
    seed(&store, [account(1, "ann", 10)]).await?;
    let mut provider = memory_provider::<Account>(&store, false)?;

    store.fail_writes_after(0);
    let err = provider.update_entity(account(1, "ann", 500)).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    store.clear_fault();

    assert_eq!(provider.get_entity(&1).await?.unwrap().credit, 10);
    provider.update_entity_property(&1, "credit", json!(11)).await?;
    assert_eq!(store.document("account", &json!(1)).unwrap()["credit"], json!(11));
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, Entity)]
#[entity(name = "line_item", embedded_identifier)]
struct LineItem {
    id: (i64, i64),
    quantity: i64,
}

#[test]
fn embedded_identifiers_are_rejected_at_construction() {
    let store = MemoryStore::new();
    let result = EntityProvider::new(store.session::<LineItem>(), ProviderConfig::default());
    assert!(matches!(
        result,
        Err(Error::UnsupportedIdentifier { ref entity }) if entity == "line_item"
    ));
}

#[test]
fn invalid_alias_is_rejected_at_construction() {
    let store = MemoryStore::new();
    let result = EntityProvider::new(
        store.session::<Account>(),
        ProviderConfig::default().alias("obj; drop"),
    );
    assert!(matches!(result, Err(Error::ContractViolation(_))));
}
