mod common;

use common::{insert, open, wait};
use dyntable::backend::{self, Envelope};
use dyntable::backend::column_type::DataType;
use dyntable::backend::data::ListQuery;
use dyntable::backend::sync::JobStatus;
use dyntable::Database;
use serde_json::{json, Value};

fn new_table(db: &Database, name: &str) -> i64 {
    let created = backend::post_table(db, &json!({"databaseId": 1, "name": name}).to_string());
    assert_eq!(created.status, 201);
    return created.data.expect("table").oid;
}

fn new_column(db: &Database, body: Value) -> Envelope<backend::column::Metadata> {
    return backend::post_column(db, &body.to_string());
}

#[test]
fn created_resources_answer_201_and_reads_200() {
    let t = open();
    let db = &t.db;
    let table_oid = new_table(db, "Contacts");

    let column = new_column(db, json!({"tableId": table_oid, "name": "Name", "dataType": "text", "isRequired": true}));
    assert_eq!(column.status, 201);
    assert!(column.is_success());
    let column = column.data.expect("column");
    assert_eq!(column.data_type(), DataType::Text);
    assert!(column.is_required);

    let record = backend::post_record(db, &json!({"tableId": table_oid, "data": {"Name": "Grace"}}).to_string());
    assert_eq!(record.status, 201);
    let record_oid = record.data.expect("record").oid;

    let fetched = backend::get_record(db, record_oid);
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.data.expect("record").data.get("Name"), Some(&json!("Grace")));

    let view = backend::get_table_records(db, table_oid, &ListQuery::default());
    assert_eq!(view.status, 200);
    assert_eq!(view.data.expect("view").records.total, 1);

    let score = new_column(db, json!({"tableId": table_oid, "name": "Score", "dataType": "rating", "ratingConfig": {"maxStars": 7}}));
    assert_eq!(score.status, 201);
    let score = serde_json::to_value(score.data.expect("score")).expect("serialize");
    assert_eq!(score["dataType"], json!("rating"));
    assert_eq!(score["ratingConfig"], json!({"maxStars": 7, "allowHalf": false}));

    let tables = backend::get_tables(db, 1);
    assert_eq!(tables.data.expect("tables").len(), 1);
    assert_eq!(backend::get_table_columns(db, table_oid).data.expect("columns").len(), 2);
}

#[test]
fn envelope_serializes_camel_case() {
    let t = open();
    let db = &t.db;
    let table_oid = new_table(db, "Contacts");
    let envelope = backend::get_table(db, table_oid);
    let value = serde_json::to_value(&envelope).expect("serialize");
    assert_eq!(value["status"], json!(200));
    assert_eq!(value["data"]["oid"], json!(table_oid));
    assert_eq!(value["data"]["databaseOid"], json!(1));
    assert_eq!(value["data"]["name"], json!("Contacts"));
    assert!(value.get("code").is_none());

    let missing = serde_json::to_value(backend::get_table(db, 999)).expect("serialize");
    assert_eq!(missing["status"], json!(404));
    assert_eq!(missing["data"], Value::Null);
    assert_eq!(missing["code"], json!("table_not_found"));
    assert_eq!(missing["message"], json!("table 999 not found"));
}

#[test]
fn failures_map_to_statuses() {
    let t = open();
    let db = &t.db;
    let table_oid = new_table(db, "Contacts");
    new_column(db, json!({"tableId": table_oid, "name": "Name", "dataType": "text"}));

    // Malformed bodies
    assert_eq!(backend::post_table(db, "{not json").status, 400);
    assert_eq!(new_column(db, json!({"tableId": table_oid, "name": "Link", "dataType": "linked_table"})).status, 400);
    assert_eq!(new_column(db, json!({"tableId": table_oid, "name": "X", "dataType": "sparkles"})).status, 400);
    assert_eq!(new_column(db, json!({"tableId": table_oid, "name": "Score", "dataType": "rating", "ratingConfig": {"maxStars": 11}})).status, 400);

    // Duplicate names
    let duplicate = new_column(db, json!({"tableId": table_oid, "name": "Name", "dataType": "number"}));
    assert_eq!(duplicate.status, 400);
    assert_eq!(duplicate.code, Some("duplicate_column_name"));

    // Unknown resources
    assert_eq!(backend::delete_column(db, 4_040).status, 404);
    assert_eq!(backend::delete_record(db, 4_040).status, 404);
    assert_eq!(backend::get_job(db, 4_040).status, 404);
    assert_eq!(backend::put_record(db, 4_040, r#"{"data": {}}"#).status, 404);

    // Unresolvable references
    let link = new_column(db, json!({
        "tableId": table_oid,
        "name": "Friend",
        "dataType": "linkedTable",
        "linkedTableConfig": {"linkedTableId": table_oid, "allowMultiple": false}
    }));
    assert_eq!(link.status, 201);
    let dangling = backend::post_record(db, &json!({"tableId": table_oid, "data": {"Friend": 31_337}}).to_string());
    assert_eq!(dangling.status, 422);
    assert_eq!(dangling.code, Some("dangling_reference"));
}

#[test]
fn column_mutations_return_their_job() {
    let t = open();
    let db = &t.db;
    let table_oid = new_table(db, "Inventory");
    let qty = new_column(db, json!({"tableId": table_oid, "name": "Qty", "dataType": "text"})).data.expect("column").oid;
    insert(db, table_oid, json!({"Qty": "12"}));
    insert(db, table_oid, json!({"Qty": "a dozen"}));

    // Strict changes are refused with the offending records
    let strict = backend::put_column(db, qty, r#"{"dataType": "number", "coercionPolicy": "strict"}"#);
    assert_eq!(strict.status, 422);
    assert_eq!(strict.code, Some("coercion_error"));
    let details = strict.details.expect("details");
    assert_eq!(details.as_array().map(|d| d.len()), Some(1));
    assert_eq!(details[0]["originalValue"], json!("a dozen"));

    let changed = backend::put_column(db, qty, r#"{"name": "Count", "dataType": "number"}"#);
    assert_eq!(changed.status, 200);
    let mutation = changed.data.expect("mutation");
    assert_eq!(mutation.column.name, "Count");
    let handle = mutation.job.expect("job");

    // A second mutation on the same table waits for the first
    let conflict = backend::delete_column(db, qty);
    if conflict.status != 200 {
        assert_eq!(conflict.status, 409);
        assert_eq!(conflict.code, Some("migration_in_progress"));
    }
    let conflict_job = conflict.data.and_then(|m| m.job);

    let job = wait(db, Some(handle)).expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    wait(db, conflict_job);

    let report = backend::get_job_report(db, handle.job_oid);
    assert_eq!(report.status, 200);
    let report = report.data.expect("report");
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].column_name, "Count");

    let retry = backend::post_job_retry(db, handle.job_oid);
    assert_eq!(retry.status, 400);
}

#[test]
fn column_order_and_table_delete() {
    let t = open();
    let db = &t.db;
    let table_oid = new_table(db, "Board");
    let a = new_column(db, json!({"tableId": table_oid, "name": "A", "dataType": "text"})).data.expect("a").oid;
    let b = new_column(db, json!({"tableId": table_oid, "name": "B", "dataType": "text"})).data.expect("b").oid;

    let body = json!({"columns": [{"columnId": b, "order": 0}, {"columnId": a, "order": 1}]}).to_string();
    let ordered = backend::put_column_order(db, table_oid, &body);
    assert_eq!(ordered.status, 200);
    let names: Vec<String> = ordered.data.expect("columns").into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["B", "A"]);

    assert_eq!(backend::delete_table(db, table_oid).status, 200);
    assert_eq!(backend::get_table(db, table_oid).status, 404);
    assert_eq!(backend::get_table_records(db, table_oid, &ListQuery::default()).status, 404);
}
