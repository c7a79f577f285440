mod common;

use common::{add_column, create_table, insert, obj, open, wait};
use dyntable::backend::column::{self, ColumnOrder, ColumnSpec};
use dyntable::backend::column_type::{ColumnType, RatingConfig, SelectConfig};
use dyntable::backend::data::{self, ListQuery};
use dyntable::backend::table;
use dyntable::backend::table_data;
use dyntable::Error;
use serde_json::json;

#[test]
fn update_merges_only_the_given_keys() {
    let t = open();
    let db = &t.db;
    let people = create_table(db, "People");
    add_column(db, people, "Name", ColumnType::Text);
    add_column(db, people, "Age", ColumnType::Number);
    add_column(db, people, "Active", ColumnType::Checkbox);
    let ada = insert(db, people, json!({"Name": "Ada", "Age": "36", "Active": true}));
    assert_eq!(ada.data.get("Age"), Some(&json!(36)));

    let updated = data::update(db, ada.oid, obj(json!({"Age": 37}))).expect("update");
    assert_eq!(updated.data.get("Name"), Some(&json!("Ada")));
    assert_eq!(updated.data.get("Age"), Some(&json!(37)));
    assert_eq!(updated.data.get("Active"), Some(&json!(true)));

    // Null clears a value
    let cleared = data::update(db, ada.oid, obj(json!({"Active": null}))).expect("clear");
    assert!(cleared.data.get("Active").is_none());
    assert_eq!(cleared.data.len(), 2);
}

#[test]
fn writes_are_validated_against_the_columns() {
    let t = open();
    let db = &t.db;
    let tasks = create_table(db, "Tasks");
    add_column(db, tasks, "Title", ColumnType::Text);
    add_column(db, tasks, "Due", ColumnType::Date);
    add_column(db, tasks, "Priority", ColumnType::SingleSelect(SelectConfig { options: vec!["low".into(), "high".into()] }));

    let err = data::create(db, tasks, obj(json!({"Owner": "me"}))).unwrap_err();
    assert_eq!(err.to_string(), "validation error: unknown column 'Owner'");
    assert!(matches!(data::create(db, tasks, obj(json!({"Due": "someday"}))), Err(Error::Validation(_))));
    assert!(matches!(data::create(db, tasks, obj(json!({"Priority": "urgent"}))), Err(Error::Validation(_))));
    assert!(matches!(data::create(db, 424_242, obj(json!({}))), Err(Error::NotFound { .. })));
    assert!(matches!(data::update(db, 424_242, obj(json!({}))), Err(Error::NotFound { .. })));
    assert!(matches!(data::delete(db, 424_242), Err(Error::NotFound { .. })));

    let task = insert(db, tasks, json!({"Title": "Ship", "Due": "2024-03-01", "Priority": "high"}));
    assert_eq!(task.data.get("Due"), Some(&json!("2024-03-01")));

    // Column names are case-sensitive storage keys
    assert!(matches!(data::update(db, task.oid, obj(json!({"title": "x"}))), Err(Error::Validation(_))));
}

#[test]
fn required_columns_and_defaults() {
    let t = open();
    let db = &t.db;
    let items = create_table(db, "Items");
    let mut name = ColumnSpec::new("Name", ColumnType::Text);
    name.is_required = true;
    column::create(db, items, name).expect("required column");
    let mut qty = ColumnSpec::new("Qty", ColumnType::Number);
    qty.default_value = Some(json!("1"));
    let qty = column::create(db, items, qty).expect("column with default");
    assert_eq!(qty.default_value, Some(json!(1)));

    let err = data::create(db, items, obj(json!({"Qty": 4}))).unwrap_err();
    assert_eq!(err.to_string(), "validation error: column 'Name' is required");

    let item = insert(db, items, json!({"Name": "Bolt"}));
    assert_eq!(item.data.get("Qty"), Some(&json!(1)));

    // Updates only check the keys they write
    data::update(db, item.oid, obj(json!({"Qty": 9}))).expect("update other key");
    assert!(matches!(data::update(db, item.oid, obj(json!({"Name": null}))), Err(Error::Validation(_))));

    // Linked columns cannot have a default
    let mut bad = ColumnSpec::new("Parent", common::linked(items, false));
    bad.default_value = Some(json!(item.oid));
    assert!(matches!(column::create(db, items, bad), Err(Error::Validation(_))));
}

#[test]
fn unique_columns_reject_repeated_values() {
    let t = open();
    let db = &t.db;
    let users = create_table(db, "Users");
    let mut email = ColumnSpec::new("Email", ColumnType::Email);
    email.is_unique = true;
    column::create(db, users, email).expect("unique column");
    let nick = add_column(db, users, "Nick", ColumnType::Text);

    let first = insert(db, users, json!({"Email": "a@example.com", "Nick": "a"}));
    insert(db, users, json!({"Email": "b@example.com", "Nick": "a"}));
    assert!(matches!(
        data::create(db, users, obj(json!({"Email": "a@example.com"}))),
        Err(Error::Validation(_))
    ));

    // A record can keep its own value
    data::update(db, first.oid, obj(json!({"Email": "a@example.com"}))).expect("same value");

    // Making a column with repeated values unique is refused
    let err = column::update(db, nick, column::ColumnUpdate { is_unique: Some(true), ..Default::default() }).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn uniqueness_compares_type_and_value() {
    let t = open();
    let db = &t.db;
    let parts = create_table(db, "Parts");
    let code = add_column(db, parts, "Code", ColumnType::Number);
    add_column(db, parts, "Label", ColumnType::Text);
    let bolt = insert(db, parts, json!({"Code": 7, "Label": "7"}));
    let nut = insert(db, parts, json!({"Code": 8, "Label": "nut"}));
    insert(db, parts, json!({"Code": 9}));

    let conn = db.connect().expect("connection");
    assert!(data::value_taken(&conn, parts, "Code", &json!(7), None).expect("number"));
    assert!(!data::value_taken(&conn, parts, "Code", &json!("7"), None).expect("text"));
    assert!(!data::value_taken(&conn, parts, "Code", &json!(7), Some(bolt.oid)).expect("own value"));
    assert!(!data::value_taken(&conn, parts, "Code", &json!(null), None).expect("null"));
    assert!(data::value_taken(&conn, parts, "Label", &json!("7"), None).expect("label"));

    column::update(db, code, column::ColumnUpdate { is_unique: Some(true), ..Default::default() }).expect("make unique");

    // Rows written behind the engine's back are flagged in the view
    let changed = conn.execute(
        &format!("UPDATE RECORD SET DATA = json_set(DATA, '$.Code', 7) WHERE OID = {}", nut.oid),
        [],
    ).expect("raw write");
    assert_eq!(changed, 1);
    let view = table_data::get_table_view(db, parts, &ListQuery::default()).expect("view");
    let flagged: Vec<i64> = view.records.items.iter()
        .filter(|row| row.cells.iter().any(|c| c.failed_validations.iter().any(|f| f.description == "Code value is not unique!")))
        .map(|row| row.oid)
        .collect();
    assert_eq!(flagged, vec![bolt.oid, nut.oid]);
}

#[test]
fn contact_style_columns_store_canonical_values() {
    let t = open();
    let db = &t.db;
    let venues = create_table(db, "Venues");
    add_column(db, venues, "Phone", ColumnType::Phone);
    add_column(db, venues, "Opens", ColumnType::Time);
    add_column(db, venues, "Stars", ColumnType::Rating(RatingConfig { max_stars: 3, allow_half: false }));
    let built = add_column(db, venues, "Built", ColumnType::Date);

    let venue = insert(db, venues, json!({"Phone": " 555 0100 ", "Opens": "8:30 am", "Stars": "3", "Built": "1931-05-01"}));
    assert_eq!(venue.data.get("Phone"), Some(&json!("555 0100")));
    assert_eq!(venue.data.get("Opens"), Some(&json!("08:30:00")));
    assert_eq!(venue.data.get("Stars"), Some(&json!(3)));
    assert!(matches!(data::create(db, venues, obj(json!({"Stars": 4}))), Err(Error::Validation(_))));
    assert!(matches!(data::create(db, venues, obj(json!({"Phone": "n/a"}))), Err(Error::Validation(_))));

    // Dates keep their year when the column becomes a year
    wait(db, column::change_type(db, built, ColumnType::Year, None).expect("retype").job);
    assert_eq!(data::get(db, venue.oid).expect("venue").data.get("Built"), Some(&json!(1931)));
    assert!(matches!(data::update(db, venue.oid, obj(json!({"Built": 0}))), Err(Error::Validation(_))));
}

#[test]
fn listing_searches_and_paginates() {
    let t = open();
    let db = &t.db;
    let books = create_table(db, "Books");
    add_column(db, books, "Title", ColumnType::Text);
    add_column(db, books, "Year", ColumnType::Number);
    for i in 0..23 {
        insert(db, books, json!({"Title": format!("Volume {i}"), "Year": 1990 + i}));
    }
    insert(db, books, json!({"Title": "The Rust Book", "Year": 2018}));

    let first = data::list(db, books, &ListQuery::page(1, 10)).expect("first page");
    assert_eq!(first.total, 24);
    assert_eq!(first.pages, 3);
    assert_eq!(first.items.len(), 10);
    assert_eq!(first.items[0].data.get("Title"), Some(&json!("Volume 0")));

    let last = data::list(db, books, &ListQuery::page(3, 10)).expect("last page");
    assert_eq!(last.items.len(), 4);
    assert_eq!(last.items[3].data.get("Title"), Some(&json!("The Rust Book")));

    let past_end = data::list(db, books, &ListQuery::page(9, 10)).expect("past the end");
    assert!(past_end.items.is_empty());
    assert_eq!(past_end.total, 24);

    // Search is case-insensitive and looks at every value
    let found = data::list(db, books, &ListQuery::search("rust")).expect("search");
    assert_eq!(found.total, 1);
    let by_year = data::list(db, books, &ListQuery::search("2018")).expect("search by year");
    assert_eq!(by_year.total, 1);

    let paged_search = data::list(db, books, &ListQuery { search: Some("volume".into()), page: Some(2), limit: Some(20) }).expect("paged search");
    assert_eq!(paged_search.total, 23);
    assert_eq!(paged_search.items.len(), 3);

    assert!(matches!(data::list(db, 515_151, &ListQuery::default()), Err(Error::NotFound { .. })));
}

#[test]
fn columns_keep_their_order() {
    let t = open();
    let db = &t.db;
    let notes = create_table(db, "Notes");
    let a = add_column(db, notes, "A", ColumnType::Text);
    let b = add_column(db, notes, "B", ColumnType::Text);
    let mut first = ColumnSpec::new("First", ColumnType::Text);
    first.order = Some(0);
    let first = column::create(db, notes, first).expect("insert at front").oid;

    let names: Vec<String> = column::list(db, notes).expect("list").into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["First", "A", "B"]);

    let reordered = column::reorder(db, notes, &[
        ColumnOrder { column_id: b, order: 0 },
        ColumnOrder { column_id: a, order: 1 },
        ColumnOrder { column_id: first, order: 2 },
    ]).expect("reorder");
    let names: Vec<&str> = reordered.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["B", "A", "First"]);

    let other = create_table(db, "Other");
    let err = column::reorder(db, other, &[ColumnOrder { column_id: a, order: 0 }]).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn column_names_are_unique_per_table() {
    let t = open();
    let db = &t.db;
    let one = create_table(db, "One");
    let two = create_table(db, "Two");
    add_column(db, one, "Name", ColumnType::Text);

    let err = column::create(db, one, ColumnSpec::new("Name", ColumnType::Number)).unwrap_err();
    assert!(matches!(err, Error::DuplicateColumnName { .. }));
    add_column(db, one, "name", ColumnType::Text);
    add_column(db, two, "Name", ColumnType::Text);
    assert!(matches!(column::create(db, one, ColumnSpec::new("  ", ColumnType::Text)), Err(Error::Validation(_))));

    let tables = table::list(db, 1).expect("tables");
    assert_eq!(tables.len(), 2);
    assert_eq!(table::get(db, one).expect("table").columns.len(), 2);
}
