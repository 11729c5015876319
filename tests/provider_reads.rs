use anyhow::Result;
use rillview::{
    Entity, Filter, MemoryStore, PersistenceSession, SortSpec,
    testing::{memory_provider, seed},
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Entity)]
#[entity(name = "person")]
struct Person {
    id: i64,
    group: i64,
    name: String,
    age: Option<i64>,
}

fn person(id: i64, group: i64, name: &str, age: Option<i64>) -> Person {
    Person {
        id,
        group,
        name: name.into(),
        age,
    }
}

async fn people() -> Result<MemoryStore> {
    let store = MemoryStore::new();
    seed(
        &store,
        [
            person(1, 1, "Dave", Some(40)),
            person(2, 1, "Bob", Some(19)),
            person(3, 2, "Eve", Some(33)),
            person(4, 2, "Alice", Some(27)),
            person(5, 3, "Carl", None),
        ],
    )
    .await?;
    Ok(store)
}

#[tokio::test]
async fn first_and_last_are_the_ends_of_one_ordering() -> Result<()> {
    let store = people().await?;
    let mut provider = memory_provider::<Person>(&store, false)?;
    let adults = Filter::ge("age", 20);
    let by_name = SortSpec::new().asc("name");

    let ordered = provider
        .get_identifiers(Some(&adults), &by_name, 0, u64::MAX)
        .await?;
    assert_eq!(ordered, vec![4, 1, 3]);
    assert_eq!(
        provider.get_first_identifier(Some(&adults), &by_name).await?,
        Some(4)
    );
    assert_eq!(
        provider.get_last_identifier(Some(&adults), &by_name).await?,
        Some(3)
    );

    let only_eve = Filter::eq("name", "Eve");
    let first = provider.get_first_identifier(Some(&only_eve), &by_name).await?;
    let last = provider.get_last_identifier(Some(&only_eve), &by_name).await?;
    assert_eq!(first, Some(3));
    assert_eq!(first, last);

    let nobody = Filter::gt("age", 100);
    assert_eq!(provider.get_first_identifier(Some(&nobody), &by_name).await?, None);
    assert_eq!(provider.get_last_identifier(Some(&nobody), &by_name).await?, None);
    Ok(())
}

#[tokio::test]
async fn count_matches_indexed_enumeration() -> Result<()> {
    let store = people().await?;
    let mut provider = memory_provider::<Person>(&store, false)?;
    let sort = SortSpec::new().desc("group").asc("name");

    for filter in [None, Some(Filter::le("age", 35)), Some(Filter::is_null("age"))] {
        let count = provider.get_entity_count(filter.as_ref()).await?;
        let mut seen = Vec::new();
        for index in 0..count {
            let id = provider
                .get_identifier_at(filter.as_ref(), &sort, index)
                .await?
                .expect("index below count resolves");
            assert!(!seen.contains(&id), "identifier {id} returned twice");
            seen.push(id);
        }
        assert_eq!(
            provider.get_identifier_at(filter.as_ref(), &sort, count).await?,
            None
        );
        assert_eq!(
            provider
                .get_identifiers(filter.as_ref(), &sort, 0, count)
                .await?,
            seen
        );
    }

    assert_eq!(provider.get_entity_count(None).await?, 5);
    assert_eq!(provider.get_entity_count(Some(&Filter::le("age", 35))).await?, 3);
    assert_eq!(provider.get_entity_count(Some(&Filter::is_null("age"))).await?, 1);
    Ok(())
}

#[tokio::test]
async fn pages_follow_the_sorted_order() -> Result<()> {
    let store = people().await?;
    let mut provider = memory_provider::<Person>(&store, false)?;
    let sort = SortSpec::new().asc("name");

    assert_eq!(provider.get_identifiers(None, &sort, 0, 2).await?, vec![4, 2]);
    assert_eq!(provider.get_identifiers(None, &sort, 2, 2).await?, vec![5, 1]);
    assert_eq!(provider.get_identifiers(None, &sort, 4, 2).await?, vec![3]);
    // no sort keys still yields a total order on the identifier
    assert_eq!(
        provider.get_identifiers(None, &SortSpec::new(), 0, 10).await?,
        vec![1, 2, 3, 4, 5]
    );
    Ok(())
}

#[tokio::test]
async fn three_entity_scenario_walks_group_then_name() -> Result<()> {
    let store = MemoryStore::new();
    seed(
        &store,
        [
            person(10, 1, "B", None),
            person(11, 1, "A", None),
            person(12, 2, "A", None),
        ],
    )
    .await?;
    let mut provider = memory_provider::<Person>(&store, false)?;
    let sort = SortSpec::new().asc("group").asc("name");

    let first = provider.get_first_identifier(None, &sort).await?;
    assert_eq!(first, Some(11));
    let second = provider.get_next_identifier(&11, None, &sort).await?;
    assert_eq!(second, Some(10));
    let third = provider.get_next_identifier(&10, None, &sort).await?;
    assert_eq!(third, Some(12));
    assert_eq!(provider.get_next_identifier(&12, None, &sort).await?, None);

    assert_eq!(provider.get_previous_identifier(&12, None, &sort).await?, Some(10));
    assert_eq!(provider.get_previous_identifier(&11, None, &sort).await?, None);
    Ok(())
}

#[tokio::test]
async fn contains_entity_requires_id_and_filter_to_match() -> Result<()> {
    let store = people().await?;
    let mut provider = memory_provider::<Person>(&store, false)?;
    let second_group = Filter::eq("group", 2);

    assert!(provider.contains_entity(&3, None).await?);
    assert!(provider.contains_entity(&3, Some(&second_group)).await?);
    assert!(!provider.contains_entity(&1, Some(&second_group)).await?);
    assert!(!provider.contains_entity(&99, None).await?);
    assert!(!provider.contains_entity(&99, Some(&second_group)).await?);
    Ok(())
}

#[tokio::test]
async fn get_entity_returns_stored_state_or_none() -> Result<()> {
    let store = people().await?;
    let mut provider = memory_provider::<Person>(&store, false)?;

    assert_eq!(
        provider.get_entity(&4).await?,
        Some(person(4, 2, "Alice", Some(27)))
    );
    assert_eq!(provider.get_entity(&42).await?, None);
    Ok(())
}

#[tokio::test]
async fn reads_see_writes_from_another_provider() -> Result<()> {
    let store = people().await?;
    let mut reader = memory_provider::<Person>(&store, false)?;
    let mut writer = memory_provider::<Person>(&store, true)?;

    assert_eq!(reader.get_entity(&1).await?.unwrap().name, "Dave");
    writer
        .update_entity_property(&1, "name", serde_json::json!("David"))
        .await?;
    assert_eq!(reader.get_entity(&1).await?.unwrap().name, "David");

    writer.remove_entity(&1).await?;
    assert_eq!(reader.get_entity(&1).await?, None);
    assert!(reader.session().managed(&serde_json::json!(1)).is_none());
    Ok(())
}
