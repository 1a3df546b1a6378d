//! Jira adapter against a scripted transport.

use std::sync::Arc;

use futures::TryStreamExt;
use serde_json::{Value, json};

use pmac_core::hash::FieldSet;
use pmac_core::plan::EntityKind;
use pmac_core::tracker::{
    ArtifactDraft, IssueDraft, IssueFilter, JiraAdapter, JiraConfig, Lookup, Method, ParentLink,
    Request, TrackerAdapter, TrackerError,
};
use pmac_test_utils::ScriptedTransport;

const ISSUE: &str = "/rest/api/2/issue";
const SEARCH: &str = "/rest/api/2/search";
const SPRINT: &str = "/rest/agile/1.0/sprint";
const BOARD: &str = "/rest/agile/1.0/board";

fn config() -> JiraConfig {
    let mut config = JiraConfig::new("PM");
    config.board_id = Some(12);
    config
}

fn adapter(transport: &Arc<ScriptedTransport>, config: JiraConfig) -> JiraAdapter {
    JiraAdapter::new(config, transport.clone())
}

fn query_value<'a>(request: &'a Request, key: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn issue_json(key: &str, issue_type: &str, summary: &str, status: &str, labels: &[&str]) -> Value {
    json!({
        "key": key,
        "fields": {
            "summary": summary,
            "description": "Collect card details",
            "labels": labels,
            "status": { "name": status },
            "issuetype": { "name": issue_type },
            "updated": "2025-06-01T10:00:00.000+0000",
            "customfield_10016": 3.0,
        }
    })
}

fn story_draft() -> IssueDraft {
    IssueDraft {
        kind: EntityKind::Story,
        plan_id: "S1".to_string(),
        fields: FieldSet {
            title: "Card form".to_string(),
            description: "Collect card details".to_string(),
            labels: vec!["frontend".to_string()],
            status: Some("In Progress".to_string()),
            points: Some(3),
            ..FieldSet::default()
        },
        parent: Some(ParentLink {
            plan_id: "E1".to_string(),
            remote_id: "PM-1".to_string(),
        }),
    }
}

fn sprint_fields() -> FieldSet {
    let mut fields = FieldSet::new("Sprint 1");
    fields
        .extra
        .insert("start_date".to_string(), "2025-06-02".to_string());
    fields
        .extra
        .insert("end_date".to_string(), "2025-06-13".to_string());
    fields
}

// ===========================================================================
// Issues
// ===========================================================================

#[tokio::test]
async fn created_story_is_transitioned_into_its_status() {
    let transport = ScriptedTransport::new();
    let path = format!("{ISSUE}/PM-3");
    transport
        .on(Method::Post, ISSUE, json!({ "id": "10003", "key": "PM-3" }))
        .on(
            Method::Get,
            &path,
            issue_json("PM-3", "Story", "Card form", "To Do", &["frontend", "pmac:S1"]),
        )
        .on(
            Method::Get,
            &format!("{path}/transitions"),
            json!({ "transitions": [
                { "id": "11", "to": { "name": "To Do" } },
                { "id": "21", "to": { "name": "In Progress" } },
            ]}),
        )
        .on(Method::Post, &format!("{path}/transitions"), Value::Null)
        .on(
            Method::Get,
            &path,
            issue_json("PM-3", "Story", "Card form", "In Progress", &["frontend", "pmac:S1"]),
        );
    let jira = adapter(&transport, config());
    let draft = story_draft();

    let record = jira.create_issue(&draft).await.expect("created");

    assert_eq!(record.remote_id, "PM-3");
    assert_eq!(record.plan_id.as_deref(), Some("S1"));
    assert_eq!(record.remote_hash, draft.fields.digest());
    assert_eq!(transport.unused(), 0);

    let created = transport.requests_to(Method::Post, ISSUE);
    let fields = &created[0].body.as_ref().expect("payload")["fields"];
    assert_eq!(fields["project"]["key"], "PM");
    assert_eq!(fields["issuetype"]["name"], "Story");
    assert_eq!(fields["parent"]["key"], "PM-1");
    assert_eq!(fields["customfield_10016"], 3);
    assert_eq!(fields["labels"], json!(["frontend", "pmac:S1"]));

    let moved = transport.requests_to(Method::Post, &format!("{path}/transitions"));
    assert_eq!(moved[0].body.as_ref().expect("payload")["transition"]["id"], "21");
}

#[tokio::test]
async fn update_without_a_matching_transition_fails_permanently() {
    let transport = ScriptedTransport::new();
    let path = format!("{ISSUE}/PM-3");
    transport
        .on(Method::Put, &path, Value::Null)
        .on(
            Method::Get,
            &path,
            issue_json("PM-3", "Story", "Card form", "To Do", &["pmac:S1"]),
        )
        .on(
            Method::Get,
            &format!("{path}/transitions"),
            json!({ "transitions": [{ "id": "31", "to": { "name": "Done" } }] }),
        );
    let jira = adapter(&transport, config());

    let err = jira.update_issue("PM-3", &story_draft()).await.unwrap_err();

    assert!(matches!(err, TrackerError::Api { transient: false, .. }), "got {err:?}");
    assert!(err.to_string().contains("In Progress"), "got {err}");
    let sent = transport.requests_to(Method::Put, &path);
    assert!(sent[0].body.as_ref().expect("payload")["fields"].get("project").is_none());
}

#[tokio::test]
async fn listing_pages_by_start_at_until_total() {
    let transport = ScriptedTransport::new();
    transport
        .on(
            Method::Get,
            SEARCH,
            json!({ "total": 3, "issues": [
                issue_json("PM-1", "Epic", "Checkout", "To Do", &["pmac:E1"]),
                issue_json("PM-2", "Story", "Card form", "To Do", &["pmac:S1"]),
            ]}),
        )
        .on(
            Method::Get,
            SEARCH,
            json!({ "total": 3, "issues": [
                issue_json("PM-3", "Story", "Payment API", "Done", &["pmac:S2"]),
            ]}),
        );
    let mut config = config();
    config.page_size = 2;
    let jira = adapter(&transport, config);

    let filter = IssueFilter::all();
    let records: Vec<_> = jira
        .list_issues(&filter)
        .try_collect()
        .await
        .expect("listing succeeds");

    let keys: Vec<&str> = records.iter().map(|r| r.remote_id.as_str()).collect();
    assert_eq!(keys, vec!["PM-1", "PM-2", "PM-3"]);
    assert_eq!(records[0].kind, Some(EntityKind::Epic));
    assert_eq!(records[0].fields.points, None, "epics carry no points");
    assert_eq!(records[1].fields.points, Some(3));

    let requests = transport.requests_to(Method::Get, SEARCH);
    assert_eq!(
        query_value(&requests[0], "jql"),
        Some("project = \"PM\" AND issuetype in (Epic, Story) ORDER BY key ASC")
    );
    let offsets: Vec<_> = requests.iter().map(|r| query_value(r, "startAt")).collect();
    assert_eq!(offsets, vec![Some("0"), Some("2")]);
}

#[tokio::test]
async fn open_only_listing_excludes_done_issues() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Get, SEARCH, json!({ "total": 0, "issues": [] }));
    let jira = adapter(&transport, config());

    let filter = IssueFilter::default();
    let records: Vec<_> = jira.list_issues(&filter).try_collect().await.expect("listing");

    assert!(records.is_empty());
    let jql = transport.requests_to(Method::Get, SEARCH)[0].clone();
    assert!(
        query_value(&jql, "jql").is_some_and(|q| q.contains("statusCategory != Done")),
        "got {jql:?}"
    );
}

#[tokio::test]
async fn lookup_uses_the_id_label_before_the_summary() {
    let transport = ScriptedTransport::new();
    transport.on(
        Method::Get,
        SEARCH,
        json!({ "total": 1, "issues": [
            issue_json("PM-8", "Story", "Renamed remotely", "To Do", &["pmac:S1"]),
        ]}),
    );
    let jira = adapter(&transport, config());
    let lookup = Lookup {
        kind: EntityKind::Story,
        plan_id: "S1".to_string(),
        title: "Card form".to_string(),
        key: None,
    };

    let record = jira.find_by_title_or_key(&lookup).await.expect("found");

    assert_eq!(record.remote_id, "PM-8");
    let searches = transport.requests_to(Method::Get, SEARCH);
    assert_eq!(searches.len(), 1);
    assert_eq!(
        query_value(&searches[0], "jql"),
        Some("project = \"PM\" AND labels = \"pmac:S1\"")
    );
}

#[tokio::test]
async fn summary_search_requires_an_exact_match() {
    let transport = ScriptedTransport::new();
    transport
        .on(Method::Get, SEARCH, json!({ "total": 0, "issues": [] }))
        .on(
            Method::Get,
            SEARCH,
            json!({ "total": 1, "issues": [
                issue_json("PM-9", "Story", "Card form \"v2\"", "To Do", &[]),
            ]}),
        );
    let jira = adapter(&transport, config());
    let lookup = Lookup {
        kind: EntityKind::Story,
        plan_id: "S1".to_string(),
        title: "Card form".to_string(),
        key: None,
    };

    let err = jira.find_by_title_or_key(&lookup).await.unwrap_err();

    assert!(err.is_not_found(), "got {err:?}");
    let searches = transport.requests_to(Method::Get, SEARCH);
    assert_eq!(
        query_value(&searches[1], "jql"),
        Some("project = \"PM\" AND summary ~ \"Card form\"")
    );
}

// ===========================================================================
// Sprints and boards
// ===========================================================================

#[tokio::test]
async fn sprint_is_created_on_the_configured_board() {
    let transport = ScriptedTransport::new();
    transport.on(
        Method::Post,
        SPRINT,
        json!({
            "id": 44,
            "name": "Sprint 1",
            "startDate": "2025-06-02T00:00:00.000Z",
            "endDate": "2025-06-13T00:00:00.000Z",
        }),
    );
    let jira = adapter(&transport, config());
    let artifact = ArtifactDraft {
        plan_id: "Sprint 1".to_string(),
        fields: sprint_fields(),
        items: Vec::new(),
    };

    let record = jira
        .create_project_artifact(EntityKind::Sprint, &artifact)
        .await
        .expect("created");

    assert_eq!(record.remote_id, "44");
    assert_eq!(record.fields, sprint_fields());
    // Agile sprints report no modification time.
    assert_eq!(record.last_seen_at, None);
    let sent = transport.requests_to(Method::Post, SPRINT);
    let body = sent[0].body.as_ref().expect("payload");
    assert_eq!(body["originBoardId"], 12);
    assert_eq!(body["startDate"], "2025-06-02T00:00:00.000Z");
}

#[tokio::test]
async fn sprint_without_a_board_is_a_permanent_error() {
    let transport = ScriptedTransport::new();
    let jira = adapter(&transport, JiraConfig::new("PM"));
    let artifact = ArtifactDraft {
        plan_id: "Sprint 1".to_string(),
        fields: sprint_fields(),
        items: Vec::new(),
    };

    let err = jira
        .create_project_artifact(EntityKind::Sprint, &artifact)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("board_id"), "got {err}");
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn sprint_lookup_walks_board_pages() {
    let transport = ScriptedTransport::new();
    let path = format!("{BOARD}/12/sprint");
    transport
        .on(
            Method::Get,
            &path,
            json!({ "isLast": false, "values": [{ "id": 40, "name": "Sprint 0" }] }),
        )
        .on(
            Method::Get,
            &path,
            json!({ "isLast": true, "values": [{
                "id": 44,
                "name": "Sprint 1",
                "startDate": "2025-06-02T09:00:00.000Z",
                "endDate": "2025-06-13T17:00:00.000Z",
            }]}),
        );
    let jira = adapter(&transport, config());
    let lookup = Lookup {
        kind: EntityKind::Sprint,
        plan_id: "Sprint 1".to_string(),
        title: "Sprint 1".to_string(),
        key: None,
    };

    let record = jira.find_by_title_or_key(&lookup).await.expect("found");

    assert_eq!(record.remote_id, "44");
    assert_eq!(record.fields, sprint_fields());
    let offsets: Vec<_> = transport
        .requests_to(Method::Get, &path)
        .iter()
        .map(|r| query_value(r, "startAt").map(str::to_string))
        .collect();
    assert_eq!(offsets, vec![Some("0".to_string()), Some("1".to_string())]);
}

#[tokio::test]
async fn boards_compare_by_name_only_and_cannot_be_updated() {
    let transport = ScriptedTransport::new();
    transport.on(
        Method::Get,
        BOARD,
        json!({ "values": [{ "id": 5, "name": "Team board", "type": "kanban" }] }),
    );
    let jira = adapter(&transport, config());
    let mut fields = FieldSet::new("Team board");
    fields.extra.insert("type".to_string(), "kanban".to_string());
    fields
        .extra
        .insert("columns".to_string(), "To Do,Done".to_string());

    let projected = jira.representable_fields(EntityKind::View, &fields);
    assert_eq!(projected, FieldSet::new("Team board"));

    let lookup = Lookup {
        kind: EntityKind::View,
        plan_id: "Team board".to_string(),
        title: "Team board".to_string(),
        key: None,
    };
    let record = jira.find_by_title_or_key(&lookup).await.expect("found");
    assert_eq!(record.remote_id, "5");
    assert_eq!(record.remote_hash, projected.digest());

    let artifact = ArtifactDraft {
        plan_id: "Team board".to_string(),
        fields,
        items: Vec::new(),
    };
    let err = jira
        .update_project_artifact(EntityKind::View, "5", &artifact)
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Api { transient: false, .. }));
}

#[tokio::test]
async fn board_creation_needs_a_filter() {
    let transport = ScriptedTransport::new();
    transport.on(
        Method::Post,
        BOARD,
        json!({ "id": 6, "name": "Team board", "type": "scrum" }),
    );
    let mut fields = FieldSet::new("Team board");
    fields.extra.insert("type".to_string(), "scrum".to_string());
    let artifact = ArtifactDraft {
        plan_id: "Team board".to_string(),
        fields,
        items: Vec::new(),
    };

    let without = adapter(&transport, config());
    let err = without
        .create_project_artifact(EntityKind::View, &artifact)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("filter_id"), "got {err}");

    let mut with_filter = config();
    with_filter.filter_id = Some(10040);
    let record = adapter(&transport, with_filter)
        .create_project_artifact(EntityKind::View, &artifact)
        .await
        .expect("created");
    assert_eq!(record.remote_id, "6");
    let sent = transport.requests_to(Method::Post, BOARD);
    let body = sent[0].body.as_ref().expect("payload");
    assert_eq!(body["type"], "scrum");
    assert_eq!(body["filterId"], 10040);
}
