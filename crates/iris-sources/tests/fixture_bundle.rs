use std::path::Path;

use iris_core::IssueState;
use iris_sources::{bundle_to_records, load_fixture_bundle};

#[test]
fn acme_widgets_fixture_normalizes() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let bundle = load_fixture_bundle(root.join("fixtures/acme-widgets/issues.json")).expect("fixture bundle");
    assert_eq!(bundle.repository, "acme/widgets");

    let records = bundle_to_records(&bundle);
    // The pull request is dropped; the untitled payload is kept for validation to reject.
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.number != 105));

    let leak = &records[0];
    assert_eq!(leak.labels, vec!["bug".to_string(), "performance".to_string()]);
    assert_eq!(leak.reaction_count, 9);
    assert_eq!(leak.author.as_deref(), Some("ada"));

    let closed = records.iter().find(|r| r.number == 104).expect("closed issue");
    assert_eq!(closed.state, IssueState::Closed);

    let untitled = records.iter().find(|r| r.number == 106).expect("untitled issue");
    assert!(untitled.validate().is_err());
}
