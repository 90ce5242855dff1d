// End-to-end analysis runs against a scripted tracker.
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use wits::analyze::{execute, AnalysisPlan, Mode};
use wits::fetch::transport::ScriptedTransport;
use wits::fetch::{AdoClient, ClientSettings};
use wits::reconcile::CancelFlag;
use wits::window::Zone;

fn client(transport: &Arc<ScriptedTransport>) -> AdoClient {
    AdoClient::new(
        Url::parse("https://dev.azure.com/contoso").unwrap(),
        Arc::clone(transport) as Arc<dyn wits::fetch::transport::Transport>,
        &ClientSettings {
            rate_limit: Duration::ZERO,
            ..ClientSettings::default()
        },
    )
}

fn plan(mode: Mode, states: &[&str]) -> AnalysisPlan {
    let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
    let mut plan = AnalysisPlan::new(day, day, Zone::parse(Some("UTC")).unwrap()).unwrap();
    plan.mode = mode;
    plan.projects = vec!["EDW".to_string()];
    plan.states = states.iter().map(|s| s.to_string()).collect();
    plan.work_item_types = vec!["Bug".to_string()];
    plan
}

fn item(id: u32, title: &str) -> Value {
    json!({
        "id": id,
        "rev": 3,
        "fields": {
            "System.Title": title,
            "System.TeamProject": "EDW",
            "System.WorkItemType": "Bug",
            "System.AreaPath": "EDW\\Team 1",
            "System.Tags": "DataOps"
        }
    })
}

fn state_update(id: u32, rev: u32, old: Option<&str>, new: &str, at: &str) -> Value {
    json!({
        "id": rev,
        "workItemId": id,
        "rev": rev,
        "fields": {
            "System.State": {"oldValue": old, "newValue": new},
            "Microsoft.VSTS.Common.StateChangeDate": {"newValue": at}
        }
    })
}

/// WIQL discovery of items 1, 2 and 3; item 3's history cannot be fetched.
fn wiql_tracker() -> Arc<ScriptedTransport> {
    let mut resolved_by_ana = state_update(1, 2, Some("Active"), "Resolved", "2024-01-10T08:00:00Z");
    resolved_by_ana["revisedBy"] = json!({"displayName": "Ana"});

    Arc::new(
        ScriptedTransport::new()
            .respond(
                "/_apis/wit/wiql",
                json!({"workItems": [{"id": 1}, {"id": 2}, {"id": 3}]}),
            )
            .respond(
                "workitems?ids=",
                json!({"count": 3, "value": [item(1, "Item one"), item(2, "Item two"), item(3, "Item three")]}),
            )
            .respond(
                "/workitems/1/updates",
                json!({"value": [
                    state_update(1, 1, None, "New", "2024-01-05T10:00:00Z"),
                    resolved_by_ana,
                    {"id": 3, "workItemId": 1, "rev": 3, "fields": {"System.Title": {"oldValue": "x", "newValue": "Item one"}}}
                ]}),
            )
            .respond(
                "/workitems/2/updates",
                json!({"value": [
                    state_update(2, 4, Some("Resolved"), "Closed", "2024-01-10T23:59:59.999Z"),
                    state_update(2, 5, Some("Closed"), "Resolved", "2024-01-11T00:00:00Z")
                ]}),
            )
            .fail("/workitems/3/updates", 500),
    )
}

#[tokio::test]
async fn wiql_mode_counts_transitions_and_records_failures() {
    let transport = wiql_tracker();
    let client = client(&transport);

    let run = execute(
        &client,
        &plan(Mode::Wiql, &["Resolved", "Closed"]),
        CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let results = &run.report.results;
    assert_eq!(results.states().collect::<Vec<_>>(), vec!["Resolved", "Closed"]);
    assert_eq!(results.count("Resolved"), 1);
    assert_eq!(results.count("Closed"), 1);

    let resolved = &results.get("Resolved").unwrap().items[0];
    assert_eq!(resolved.id, 1);
    assert_eq!(resolved.title.as_deref(), Some("Item one"));
    assert_eq!(resolved.old_state.as_deref(), Some("Active"));
    assert_eq!(resolved.changed_by, "Ana");
    assert_eq!(resolved.area_path.as_deref(), Some("EDW\\Team 1"));

    let closed = &results.get("Closed").unwrap().items[0];
    assert_eq!(closed.id, 2);
    assert_eq!(closed.changed_by, "Unknown");

    assert!(!run.unreachable);
    assert_eq!(run.report.failures.len(), 1);
    assert_eq!(run.report.failures[0].subject, "work item 3");
    assert_eq!(run.report.mode, "wiql");
    assert_eq!(run.stats.out_of_window, 1);
}

#[tokio::test]
async fn warm_cache_gives_identical_results() {
    let transport = wiql_tracker();
    let client = client(&transport);
    let plan = plan(Mode::Wiql, &["Resolved", "Closed"]);

    let cold = execute(&client, &plan, CancelFlag::new(), None).await.unwrap();
    let updates_after_cold = transport.call_count("/updates");
    let warm = execute(&client, &plan, CancelFlag::new(), None).await.unwrap();

    assert_eq!(
        serde_json::to_string(&cold.report.results).unwrap(),
        serde_json::to_string(&warm.report.results).unwrap()
    );
    // Only the failed item is asked again.
    assert_eq!(transport.call_count("/updates"), updates_after_cold + 1);
    assert_eq!(transport.call_count("workitems?ids="), 1);
}

#[tokio::test]
async fn revisions_mode_dedups_snapshot_and_update_records() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .respond(
                "workitemrevisions",
                json!({
                    "values": [
                        {"id": 10, "rev": 1, "fields": {
                            "System.State": "Active",
                            "System.TeamProject": "EDW",
                            "System.ChangedDate": "2024-01-10T08:00:00Z",
                            "Microsoft.VSTS.Common.StateChangeDate": "2024-01-10T08:00:00Z"
                        }},
                        {"id": 10, "rev": 2, "fields": {
                            "System.State": "Resolved",
                            "System.TeamProject": "EDW",
                            "System.ChangedBy": "Ben <ben@contoso.com>",
                            "System.ChangedDate": "2024-01-10T09:00:00Z",
                            "Microsoft.VSTS.Common.StateChangeDate": "2024-01-10T09:00:00Z"
                        }}
                    ],
                    "isLastBatch": true
                }),
            )
            .respond("workitems?ids=", json!({"value": [item(10, "Ten")]}))
            .respond(
                "/workitems/10/updates",
                json!({"value": [
                    state_update(10, 1, None, "Active", "2024-01-10T08:00:00Z"),
                    state_update(10, 2, Some("Active"), "Resolved", "2024-01-10T09:00:00Z")
                ]}),
            ),
    );
    let client = client(&transport);

    let run = execute(
        &client,
        &plan(Mode::Revisions, &["Resolved"]),
        CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(run.report.results.count("Resolved"), 1);
    assert_eq!(run.stats.duplicates, 1);
    let entry = &run.report.results.get("Resolved").unwrap().items[0];
    assert_eq!(entry.id, 10);
    assert_eq!(entry.date, "2024-01-10T09:00:00Z");
    assert!(run.report.failures.is_empty());
}

#[tokio::test]
async fn revisions_mode_keeps_old_state_and_author_from_updates() {
    let mut resolved = state_update(20, 5, Some("Active"), "Resolved", "2024-01-10T11:30:00Z");
    resolved["revisedBy"] = json!({"displayName": "Ana"});
    let transport = Arc::new(
        ScriptedTransport::new()
            .respond(
                "workitemrevisions",
                json!({
                    "values": [
                        {"id": 20, "rev": 5, "fields": {
                            "System.State": "Resolved",
                            "System.TeamProject": "EDW",
                            "System.ChangedDate": "2024-01-10T11:30:00Z",
                            "Microsoft.VSTS.Common.StateChangeDate": "2024-01-10T11:30:00Z"
                        }}
                    ],
                    "isLastBatch": true
                }),
            )
            .respond("workitems?ids=", json!({"value": [item(20, "Twenty")]}))
            .respond("/workitems/20/updates", json!({"value": [resolved]})),
    );
    let client = client(&transport);

    let run = execute(
        &client,
        &plan(Mode::Revisions, &["Resolved"]),
        CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(run.report.results.count("Resolved"), 1);
    assert_eq!(run.stats.duplicates, 1);
    let entry = &run.report.results.get("Resolved").unwrap().items[0];
    assert_eq!(entry.old_state.as_deref(), Some("Active"));
    assert_eq!(entry.changed_by, "Ana");
    assert_eq!(entry.title.as_deref(), Some("Twenty"));
}

#[tokio::test]
async fn unreachable_tracker_is_not_an_empty_result() {
    let transport = Arc::new(ScriptedTransport::new().fail("/_apis/wit/wiql", 503));
    let client = client(&transport);

    let run = execute(&client, &plan(Mode::Wiql, &["Resolved"]), CancelFlag::new(), None)
        .await
        .unwrap();

    assert!(run.unreachable);
    assert!(run.report.results.is_empty());
    assert_eq!(run.report.failures.len(), 1);
    assert_eq!(run.report.failures[0].subject, "project EDW");
}

#[tokio::test]
async fn cancelled_run_returns_no_results() {
    let transport = wiql_tracker();
    let client = client(&transport);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let result = execute(&client, &plan(Mode::Wiql, &["Resolved"]), cancel, None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn exported_report_matches_schema() {
    let transport = wiql_tracker();
    let client = client(&transport);
    let run = execute(
        &client,
        &plan(Mode::Wiql, &["Resolved", "Closed"]),
        CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let schema_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("report_schema.json");
    let schema_json: Value =
        serde_json::from_str(&std::fs::read_to_string(schema_path).unwrap()).unwrap();
    let schema = jsonschema::JSONSchema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .compile(&schema_json)
        .unwrap();

    let report_json = serde_json::to_value(&run.report).unwrap();
    let messages: Vec<String> = match schema.validate(&report_json) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    assert!(messages.is_empty(), "report does not match schema: {:?}", messages);
}
