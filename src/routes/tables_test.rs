use super::*;
use crate::state::test_helpers;

fn form(board: &str, clone_of: Option<&str>, clone_line: Option<i64>) -> CreateTableForm {
    CreateTableForm { board: board.into(), clone_of: clone_of.map(str::to_owned), clone_line }
}

#[test]
fn form_selects_genesis() {
    assert_eq!(form("B1", None, None).genesis(), Ok(Genesis::Board("B1".into())));
    assert_eq!(
        form("", Some("abc"), Some(4)).genesis(),
        Ok(Genesis::Fork { table: "abc".into(), line: 4 })
    );
    assert_eq!(form("B1", Some("abc"), None).genesis(), Err(StatusCode::BAD_REQUEST));
}

#[test]
fn registry_errors_map_to_status() {
    assert_eq!(registry_error_to_status(&RegistryError::NotFound("x".into())), StatusCode::NOT_FOUND);
    assert_eq!(registry_error_to_status(&RegistryError::InvalidId("..".into())), StatusCode::BAD_REQUEST);
    assert_eq!(registry_error_to_status(&RegistryError::IdExhausted), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn create_table_returns_new_id() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let Json(body) = create_table(State(state), Form(form("B1", None, None))).await.unwrap();
    let id = body["tableId"].as_str().unwrap();
    assert!(dir.path().join(id).exists());
}

#[tokio::test]
async fn fork_of_missing_table_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let result = create_table(State(state), Form(form("", Some("missing"), Some(0)))).await;
    assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
}
