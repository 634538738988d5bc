use stance_harness::catalog::{fingerprint, CatalogError, Item, ItemCatalog};
use stance_harness::gateway::Provider;
use stance_harness::subject::{EntityRoster, JudgeSettings, Subject, SubjectKind};
use tempfile::tempdir;

const CATALOG: &str = r#"{
    "economy": ["Raise the minimum wage", "Cut corporate taxes"],
    "energy": ["Expand nuclear power"]
}"#;

#[test]
fn catalog_loads_categories_in_sorted_order() {
    let catalog = ItemCatalog::from_json_str(CATALOG).unwrap();
    let texts: Vec<&str> = catalog.items().iter().map(|i| i.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["Raise the minimum wage", "Cut corporate taxes", "Expand nuclear power"]
    );
    assert_eq!(catalog.items()[2].category, "energy");
    assert_eq!(catalog.items()[0].id.len(), 16);
    assert_eq!(catalog.index_of(&catalog.items()[1].id), Some(1));
}

#[test]
fn fingerprint_is_stable_across_loads_and_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("policies.json");
    std::fs::write(&path, CATALOG).unwrap();

    let from_file = ItemCatalog::load(&path).unwrap();
    let from_str = ItemCatalog::from_json_str(CATALOG).unwrap();
    assert_eq!(from_file.fingerprint(), from_str.fingerprint());
    assert_eq!(from_file.fingerprint(), fingerprint(from_file.items()));
}

#[test]
fn fingerprint_tracks_order_membership_and_text() {
    let a = Item::new("x", "first");
    let b = Item::new("x", "second");
    let c = Item::new("x", "third");

    let base = fingerprint(&[a.clone(), b.clone()]);
    assert_ne!(base, fingerprint(&[b.clone(), a.clone()]));
    assert_ne!(base, fingerprint(&[a.clone(), b.clone(), c]));
    assert_ne!(base, fingerprint(&[a, Item::new("x", "second!")]));
}

#[test]
fn catalog_rejects_duplicates_and_tiny_sets() {
    let dup = ItemCatalog::new(vec![Item::new("x", "same"), Item::new("x", "same")]);
    assert!(matches!(dup, Err(CatalogError::Duplicate { .. })));

    let tiny = ItemCatalog::new(vec![Item::new("x", "alone")]);
    assert!(matches!(tiny, Err(CatalogError::TooSmall(1))));

    assert!(matches!(
        ItemCatalog::from_json_str("[1, 2]"),
        Err(CatalogError::Json(_))
    ));
}

#[test]
fn subject_keys_separate_configurations() {
    let judge = JudgeSettings::new(Provider::OpenRouter, "openai/gpt-4o");
    let base = Subject::model(judge.clone());
    assert!(base.key().as_str().starts_with("model/openai_gpt-4o/"));
    assert_eq!(base.key(), Subject::model(judge.clone()).key());

    let hotter = Subject::model(JudgeSettings {
        temperature: 0.2,
        ..judge.clone()
    });
    assert_ne!(base.key(), hotter.key());

    let prompted = Subject::model(JudgeSettings {
        system_prompt: Some("Answer tersely.".to_string()),
        ..judge.clone()
    });
    assert_ne!(base.key(), prompted.key());

    let politician = Subject::politician("Jane Doe", judge);
    assert!(politician.key().as_str().starts_with("politician/jane_doe/"));
}

#[test]
fn roster_lists_politicians_then_platforms() {
    let roster: EntityRoster =
        serde_json::from_str(r#"{"politicians": ["A B"], "platforms": ["Green Party"]}"#).unwrap();
    let subjects = roster.subjects(&JudgeSettings::new(Provider::OpenAi, "gpt-4o-mini"));
    let kinds: Vec<SubjectKind> = subjects.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![SubjectKind::Politician, SubjectKind::Platform]);
    assert_eq!(subjects[1].name, "Green Party");
}
