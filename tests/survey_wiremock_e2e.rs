use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stance_harness::cache::{SqliteUtilityCache, UtilityCache};
use stance_harness::gateway::provider::OpenAiCompatAdapter;
use stance_harness::gateway::{GatewayConfig, NoopUsageSink, Provider, ProviderGateway};
use stance_harness::projection::ProjectionConfig;
use stance_harness::sampler::{JudgmentSource, LlmJudge, SamplerConfig};
use stance_harness::store::UtilityStore;
use stance_harness::subject::{JudgeSettings, Subject};
use stance_harness::survey::{SubjectStatus, Survey, SurveyConfig};
use stance_harness::{Item, ItemCatalog};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const N_ITEMS: usize = 5;

/// Answers as each simulated entity would, from the measure numbers in the prompt.
struct Electorate;

impl Electorate {
    fn utility(prompt: &str, measure: i64) -> f64 {
        let m = measure as f64;
        if prompt.contains("Left Person") {
            -m
        } else if prompt.contains("Right Person") {
            m
        } else if prompt.contains("Centre Platform") {
            -(m - 2.0).abs() + 0.1 * m
        } else {
            0.5 * m
        }
    }

    fn measures(prompt: &str) -> Vec<i64> {
        prompt
            .split("Measure number ")
            .skip(1)
            .filter_map(|rest| {
                rest.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .ok()
            })
            .collect()
    }
}

impl Respond for Electorate {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let prompt = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        let measures = Self::measures(&prompt);
        let answer = match measures.as_slice() {
            [a, b] if Self::utility(&prompt, *a) >= Self::utility(&prompt, *b) => "A",
            [_, _] => "B",
            _ => "I do not understand.",
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": answer }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 60, "completion_tokens": 1 }
        }))
    }
}

fn catalog() -> ItemCatalog {
    ItemCatalog::new(
        (0..N_ITEMS)
            .map(|n| Item::new("measures", format!("Measure number {n}")))
            .collect(),
    )
    .unwrap()
}

fn subjects() -> Vec<Subject> {
    let judge = JudgeSettings::new(Provider::OpenRouter, "openai/gpt-4o-mini");
    vec![
        Subject::model(judge.clone()),
        Subject::politician("Left Person", judge.clone()),
        Subject::politician("Right Person", judge.clone()),
        Subject::platform("Centre Platform", judge),
    ]
}

fn survey(server: &MockServer, store: Arc<UtilityStore>) -> Survey {
    let adapter = OpenAiCompatAdapter::with_config(
        Provider::OpenRouter,
        "sk-test",
        server.uri(),
        Duration::from_secs(5),
    )
    .unwrap();
    let gateway = ProviderGateway::with_config(
        Arc::new(NoopUsageSink),
        GatewayConfig::single_attempt(),
    )
    .with_adapter(adapter);
    let source: Arc<dyn JudgmentSource> = Arc::new(LlmJudge::new(Arc::new(gateway)));

    let cfg = SurveyConfig {
        sampler: SamplerConfig {
            trials_per_pair: 2,
            concurrency: 8,
            retry_base_delay: Duration::from_millis(1),
            ..SamplerConfig::default()
        },
        projection: ProjectionConfig {
            anchor: Some("Left Person".to_string()),
            ..ProjectionConfig::default()
        },
        ..SurveyConfig::default()
    };
    Survey::new(source, store, cfg)
}

#[tokio::test]
async fn survey_samples_fits_caches_and_projects_every_subject() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(Electorate)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let catalog = catalog();
    let subjects = subjects();
    let pairs = N_ITEMS * (N_ITEMS - 1) / 2;

    let store = Arc::new(UtilityStore::new(Arc::new(SqliteUtilityCache::new(&db).unwrap())));
    let report = survey(&server, store.clone())
        .run(&subjects, &catalog)
        .await
        .unwrap();

    assert_eq!(report.computed(), 4);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.fingerprint, catalog.fingerprint());
    let names: Vec<&str> = report.subjects.iter().map(|s| s.subject_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["openai/gpt-4o-mini", "Left Person", "Right Person", "Centre Platform"]
    );
    for subject in &report.subjects {
        let stats = subject.stats.unwrap();
        assert_eq!(stats.trials_requested, (pairs * 2) as u64);
        assert_eq!(stats.trials_valid, stats.trials_requested);
        assert_eq!(subject.converged, Some(true));
    }
    let requests = server.received_requests().await.unwrap().len();
    assert_eq!(requests, 4 * pairs * 2);

    let projection = report.projection.expect("projection");
    assert!(projection.anchored);
    assert_eq!(projection.rows.len(), 4);
    let left = projection
        .rows
        .iter()
        .find(|r| r.subject_name == "Left Person")
        .unwrap();
    let right = projection
        .rows
        .iter()
        .find(|r| r.subject_name == "Right Person")
        .unwrap();
    assert!(left.x < 0.0);
    assert!(left.y >= 0.0);
    assert!(right.x > left.x);

    // The model's utilities rise with the measure number.
    let model_key = subjects[0].key().to_string();
    let entries = store
        .entries_for_fingerprint(catalog.fingerprint())
        .await
        .unwrap();
    let model = entries.iter().find(|e| e.subject_key == model_key).unwrap();
    let means: Vec<f64> = model.means.iter().map(|m| m.unwrap()).collect();
    assert!(means.windows(2).all(|w| w[0] < w[1]), "{means:?}");
    assert_eq!(model.item_ids, catalog.ids());

    // A second run over a reopened cache makes no judge calls.
    let reopened = Arc::new(UtilityStore::new(Arc::new(SqliteUtilityCache::new(&db).unwrap())));
    let again = survey(&server, reopened).run(&subjects, &catalog).await.unwrap();
    assert_eq!(again.cached(), 4);
    assert!(again
        .subjects
        .iter()
        .all(|s| s.status == SubjectStatus::Cached && s.stats.is_none()));
    assert_eq!(server.received_requests().await.unwrap().len(), requests);
    assert_eq!(again.projection.unwrap().rows, projection.rows);
}

#[tokio::test]
async fn changed_item_set_recomputes_and_projects_separately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(Electorate)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteUtilityCache::new(dir.path().join("cache.sqlite")).unwrap());
    let store = Arc::new(UtilityStore::new(cache.clone()));
    let subjects = &subjects()[1..3];

    let first = catalog();
    survey(&server, store.clone()).run(subjects, &first).await.unwrap();

    let mut items = first.items().to_vec();
    items.pop();
    let smaller = ItemCatalog::new(items).unwrap();
    let report = survey(&server, store).run(subjects, &smaller).await.unwrap();
    assert_eq!(report.computed(), 2);

    let projection = report.projection.unwrap();
    assert_eq!(projection.item_ids.len(), N_ITEMS - 1);
    assert_eq!(projection.rows.len(), 2);
    assert_eq!(cache.entries_for_fingerprint(first.fingerprint()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn single_subject_survey_reports_projection_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(Electorate)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let store = Arc::new(UtilityStore::new(Arc::new(
        SqliteUtilityCache::new(dir.path().join("cache.sqlite")).unwrap(),
    )));
    let report = survey(&server, store)
        .run(&subjects()[..1], &catalog())
        .await
        .unwrap();
    assert_eq!(report.computed(), 1);
    assert!(report.projection.is_none());
    assert!(report.projection_error.unwrap().contains("at least two"));
}
