use chrono::Utc;
use stance_harness::projection::{project, ProjectionConfig, ProjectionError};
use stance_harness::subject::SubjectKind;
use stance_harness::CacheEntry;

fn entry(key: &str, name: &str, fingerprint: &str, means: Vec<Option<f64>>) -> CacheEntry {
    let n = means.len();
    CacheEntry {
        subject_key: key.to_string(),
        subject_name: name.to_string(),
        subject_kind: SubjectKind::Politician,
        judge_model: "sim".to_string(),
        system_prompt_hash: "h".to_string(),
        fingerprint: fingerprint.to_string(),
        item_ids: (0..n).map(|i| format!("item{i}")).collect(),
        stds: means.iter().map(|m| m.map(|_| 0.1)).collect(),
        means,
        excluded_items: Vec::new(),
        trials_per_pair: 5,
        tie_band: 0.1,
        converged: true,
        iterations: 10,
        grad_norm: 1e-8,
        run_id: None,
        created_at: Utc::now(),
    }
}

fn some(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().copied().map(Some).collect()
}

/// Two camps disagreeing on items 0-2, plus a second split on items 3-5.
fn electorate() -> Vec<CacheEntry> {
    vec![
        entry("politician/left", "Left Person", "fp", some(&[2.0, 1.5, 1.0, 0.2, -0.1, 0.3])),
        entry("politician/right", "Right Person", "fp", some(&[-2.0, -1.5, -1.0, 0.1, 0.2, -0.2])),
        entry("politician/up", "Up Person", "fp", some(&[0.1, -0.2, 0.0, 1.8, 1.2, 1.5])),
        entry("politician/down", "Down Person", "fp", some(&[-0.1, 0.3, 0.1, -1.6, -1.4, -1.1])),
        entry("model/m", "model", "fp", some(&[0.5, 0.2, 0.4, 0.6, 0.1, 0.3])),
    ]
}

fn coords(projection: &stance_harness::Projection, key: &str) -> (f64, f64) {
    let row = projection.row(key).unwrap();
    (row.x, row.y)
}

#[test]
fn projection_ignores_input_order() {
    let entries = electorate();
    let mut reversed = entries.clone();
    reversed.reverse();

    let a = project("fp", &entries, &ProjectionConfig::default()).unwrap();
    let b = project("fp", &reversed, &ProjectionConfig::default()).unwrap();
    assert_eq!(a, b);

    let keys: Vec<&str> = a.rows.iter().map(|r| r.subject_key.as_str()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn standardised_projection_is_invariant_to_each_subjects_gauge() {
    let entries = electorate();
    let shifted: Vec<CacheEntry> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let mut e = e.clone();
            let (offset, scale) = (i as f64 * 3.0 - 4.0, 1.0 + i as f64);
            e.means = e.means.iter().map(|m| m.map(|v| v * scale + offset)).collect();
            e
        })
        .collect();

    let a = project("fp", &entries, &ProjectionConfig::default()).unwrap();
    let b = project("fp", &shifted, &ProjectionConfig::default()).unwrap();
    for (ra, rb) in a.rows.iter().zip(&b.rows) {
        // Equal up to the sign of each axis.
        assert!((ra.x.abs() - rb.x.abs()).abs() < 1e-9, "{ra:?} vs {rb:?}");
        assert!((ra.y.abs() - rb.y.abs()).abs() < 1e-9, "{ra:?} vs {rb:?}");
    }
}

#[test]
fn explained_variance_is_ordered_and_bounded() {
    let p = project("fp", &electorate(), &ProjectionConfig::default()).unwrap();
    assert!(p.explained_variance[0] >= p.explained_variance[1]);
    assert!(p.explained_variance[1] > 0.0);
    assert!(p.explained_variance[0] + p.explained_variance[1] <= 1.0 + 1e-9);
    assert_eq!(p.loadings[0].len(), 6);
    assert_eq!(p.item_ids.len(), 6);
    assert!(!p.anchored);
}

#[test]
fn opposing_subjects_land_on_opposite_sides() {
    let p = project("fp", &electorate(), &ProjectionConfig::default()).unwrap();
    let dot = |a: (f64, f64), b: (f64, f64)| a.0 * b.0 + a.1 * b.1;
    let left = coords(&p, "politician/left");
    let right = coords(&p, "politician/right");
    let up = coords(&p, "politician/up");
    let down = coords(&p, "politician/down");
    assert!(dot(left, right) < 0.0, "left {left:?}, right {right:?}");
    assert!(dot(up, down) < 0.0, "up {up:?}, down {down:?}");
}

#[test]
fn anchor_lands_in_upper_left_quadrant() {
    for anchor in ["Left Person", "Right Person", "politician/up"] {
        let cfg = ProjectionConfig {
            anchor: Some(anchor.to_string()),
            ..ProjectionConfig::default()
        };
        let p = project("fp", &electorate(), &cfg).unwrap();
        assert!(p.anchored);
        let row = p
            .rows
            .iter()
            .find(|r| r.subject_name == anchor || r.subject_key == anchor)
            .unwrap();
        assert!(row.x <= 0.0, "{anchor}: x = {}", row.x);
        assert!(row.y >= 0.0, "{anchor}: y = {}", row.y);
    }
}

#[test]
fn missing_anchor_falls_back_to_default_orientation() {
    let cfg = ProjectionConfig {
        anchor: Some("Nobody".to_string()),
        ..ProjectionConfig::default()
    };
    let anchored = project("fp", &electorate(), &cfg).unwrap();
    let plain = project("fp", &electorate(), &ProjectionConfig::default()).unwrap();
    assert!(!anchored.anchored);
    assert_eq!(anchored.rows, plain.rows);
}

#[test]
fn sparse_and_foreign_subjects_are_excluded_with_reasons() {
    let mut entries = electorate();
    entries.push(entry(
        "politician/sparse",
        "Sparse",
        "fp",
        vec![Some(1.0), None, None, Some(0.0), Some(0.5), Some(0.2)],
    ));
    entries.push(entry("politician/old", "Old", "fp-old", some(&[1.0, 0.0, 0.5, 0.2, 0.1, 0.0])));

    let p = project("fp", &entries, &ProjectionConfig::default()).unwrap();
    assert_eq!(p.rows.len(), 5);
    let excluded: Vec<&str> = p.excluded.iter().map(|e| e.subject_key.as_str()).collect();
    assert_eq!(excluded, vec!["politician/old", "politician/sparse"]);
    assert!(p.excluded[0].reason.contains("fp-old"));
    assert!(p.excluded[1].reason.contains("missing"));

    // One missing item of six is within the default limit.
    let mut lenient = electorate();
    lenient[0].means[4] = None;
    let p = project("fp", &lenient, &ProjectionConfig::default()).unwrap();
    assert_eq!(p.rows.len(), 5);
    assert!(p.rows.iter().all(|r| r.x.is_finite() && r.y.is_finite()));
}

#[test]
fn fewer_than_two_subjects_is_an_error() {
    let entries = vec![
        entry("a", "A", "fp", some(&[1.0, 0.0, -1.0])),
        entry("b", "B", "other", some(&[1.0, 0.0, -1.0])),
    ];
    match project("fp", &entries, &ProjectionConfig::default()) {
        Err(ProjectionError::TooFewSubjects { included, excluded }) => {
            assert_eq!((included, excluded), (1, 1));
        }
        other => panic!("expected TooFewSubjects, got {other:?}"),
    }
    assert!(project("fp", &[], &ProjectionConfig::default()).is_err());
}

#[test]
fn identical_subjects_collapse_to_the_origin() {
    let entries = vec![
        entry("a", "A", "fp", some(&[1.0, 0.0, -1.0])),
        entry("b", "B", "fp", some(&[1.0, 0.0, -1.0])),
        entry("c", "C", "fp", some(&[1.0, 0.0, -1.0])),
    ];
    let p = project("fp", &entries, &ProjectionConfig::default()).unwrap();
    assert!(p.rows.iter().all(|r| r.x == 0.0 && r.y == 0.0));
    assert_eq!(p.explained_variance, [0.0, 0.0]);
}

#[test]
fn csv_has_header_and_one_line_per_subject() {
    let p = project("fp", &electorate(), &ProjectionConfig::default()).unwrap();
    let csv = p.to_csv();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "subject_key,subject_name,subject_kind,x,y,explained_variance_1,explained_variance_2"
    );
    assert_eq!(lines.len(), 6);
    assert!(lines[1].starts_with("model/m,model,"));
}
