use ctrader_auth::testing::ScriptedExchange;
use ctrader_auth::{Credentials, OAuthTokens, Settings, TokenLifecycleManager, TokenStore};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::fs;
use std::sync::Arc;

fn extra() -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("token_type".to_string(), json!("bearer"));
    extra.insert("scope".to_string(), json!("trading"));
    extra
}

#[test]
fn test_manager_is_wired_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let credentials_file = dir.path().join("credentials.json");
    fs::write(
        &credentials_file,
        r#"{"client_id": "app", "client_secret": "secret", "notes": "ignored"}"#,
    )
    .unwrap();

    let token_file = dir.path().join("token.json");
    let tokens = OAuthTokens::new("access", "refresh", 1_900_000_000, Some(7));
    TokenStore::new(&token_file)
        .save_with_extra(&tokens, extra())
        .unwrap();

    let settings = Settings {
        credentials_file,
        token_file,
        ..Settings::default()
    };
    let manager = TokenLifecycleManager::from_settings(&settings).unwrap();

    assert_eq!(manager.credentials().map(|c| c.client_id.as_str()), Some("app"));
    assert_eq!(manager.current().as_deref(), Some(&tokens));
}

#[test]
fn test_missing_files_leave_manager_empty() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        credentials_file: dir.path().join("absent.json"),
        token_file: dir.path().join("absent-token.json"),
        ..Settings::default()
    };

    let manager = TokenLifecycleManager::from_settings(&settings).unwrap();
    assert!(manager.credentials().is_none());
    assert!(manager.current().is_none());
}

#[tokio::test]
async fn test_refresh_persists_and_keeps_foreign_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("token.json"));
    let stale = OAuthTokens::new("old", "old-refresh", 0, Some(7));
    store.save_with_extra(&stale, extra()).unwrap();

    let exchange = Arc::new(ScriptedExchange::granting("fresh"));
    let manager = TokenLifecycleManager::new(
        Some(Credentials::new("app", "secret")),
        exchange.clone(),
        Some(TokenStore::new(store.path())),
    );
    manager.set_tokens(stale);

    let refreshed = manager.ensure_fresh(60).await.unwrap();
    assert_eq!(refreshed.access_token, "fresh");
    assert_eq!(refreshed.account_id, Some(7));
    assert_eq!(exchange.last_refresh_token().as_deref(), Some("old-refresh"));

    let reloaded = store.load().unwrap().unwrap();
    assert_eq!(reloaded, *refreshed);

    let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
    assert_eq!(raw["scope"], json!("trading"));
    assert_eq!(raw["access_token"], json!("fresh"));
}
