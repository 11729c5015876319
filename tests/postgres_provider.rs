use anyhow::Result;
use rillview::{Entity, Error, Filter, SortSpec, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
#[entity(name = "member")]
struct Member {
    id: i64,
    group: Option<i64>,
    name: String,
}

fn member(id: i64, group: Option<i64>, name: &str) -> Member {
    Member {
        id,
        group,
        name: name.into(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn postgres_provider_end_to_end() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::builder(&url).max_connections(4).build().await?;
    assert!(store.pool_health().await?.ok);
    store.ensure_table::<Member>().await?;

    let mut provider = store.provider::<Member>(true)?;
    for m in [
        member(10, Some(1), "B"),
        member(11, Some(1), "A"),
        member(12, Some(2), "A"),
        member(13, None, "C"),
    ] {
        provider.add_entity(m).await?;
    }

    let mut reader = store.provider::<Member>(false)?;
    let sort = SortSpec::new().asc("group").asc("name");
    assert_eq!(reader.get_entity_count(None).await?, 4);
    assert_eq!(reader.get_first_identifier(None, &sort).await?, Some(11));
    assert_eq!(reader.get_next_identifier(&11, None, &sort).await?, Some(10));
    assert_eq!(reader.get_next_identifier(&10, None, &sort).await?, Some(12));
    // null group sorts last
    assert_eq!(reader.get_next_identifier(&12, None, &sort).await?, Some(13));
    assert_eq!(reader.get_next_identifier(&13, None, &sort).await?, None);
    assert_eq!(reader.get_last_identifier(None, &sort).await?, Some(13));
    assert_eq!(reader.get_previous_identifier(&13, None, &sort).await?, Some(12));
    assert_eq!(
        reader.get_identifiers(None, &sort, 1, 2).await?,
        vec![10, 12]
    );

    let first_group = Filter::eq("group", 1);
    assert!(reader.contains_entity(&10, Some(&first_group)).await?);
    assert!(!reader.contains_entity(&12, Some(&first_group)).await?);
    assert_eq!(
        reader
            .get_entity_count(Some(&Filter::between("name", "A", "B")))
            .await?,
        3
    );

    provider
        .update_entity_property(&13, "group", json!(3))
        .await?;
    assert_eq!(reader.get_entity(&13).await?.unwrap().group, Some(3));
    assert_eq!(reader.get_next_identifier(&12, None, &sort).await?, Some(13));
    assert_eq!(
        reader.get_identifiers(None, &sort, 0, u64::MAX).await?,
        vec![11, 10, 12, 13]
    );

    let mut second = store.provider::<Member>(true)?;
    let err = second
        .add_entity(member(10, None, "duplicate"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Db(_)));
    assert_eq!(second.get_entity(&10).await?.unwrap().name, "B");
    second.add_entity(member(14, Some(4), "D")).await?;
    assert_eq!(reader.get_entity_count(None).await?, 5);

    provider.remove_entity(&10).await?;
    assert_eq!(reader.get_entity_count(None).await?, 4);
    assert_eq!(reader.get_entity(&10).await?, None);
    Ok(())
}
