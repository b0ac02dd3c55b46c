//! SQLite-backed tenant settings and the authenticated flag.

use spendwire::store::settings::{SettingsStore, TenantSettings};
use spendwire::types::{Question, SessionKey, StorageDestination};

fn key() -> SessionKey {
    SessionKey::new("acme", "+15550001")
}

fn custom() -> TenantSettings {
    TenantSettings {
        group_name: Some("Expenses".to_owned()),
        message_template: Some("Saved {merchant}".to_owned()),
        questions: vec![Question::new("what", "What did you buy?")],
        destination: StorageDestination {
            sheet_id: Some("sheet-1".to_owned()),
            folder_id: Some("folder-1".to_owned()),
        },
        ai_enabled: false,
    }
}

#[tokio::test]
async fn settings_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("spendwire.db");

    {
        let store = SettingsStore::open(&path).await.expect("open");
        store.save(&key(), &custom()).await.expect("save");
        store.set_authenticated(&key(), true).await.expect("flag");
    }

    let reopened = SettingsStore::open(&path).await.expect("reopen");
    assert_eq!(reopened.cached(&key()), TenantSettings::default());
    assert_eq!(reopened.reload(&key()).await.expect("reload"), custom());
    assert_eq!(reopened.cached(&key()), custom());
    assert!(reopened.is_authenticated(&key()).await.expect("flag"));
}

#[tokio::test]
async fn unknown_sessions_get_defaults() {
    let store = SettingsStore::in_memory().await.expect("store");

    let loaded = store.reload(&key()).await.expect("reload");
    assert_eq!(loaded, TenantSettings::default());
    assert!(loaded.ai_enabled);
    assert!(!store.is_authenticated(&key()).await.expect("flag"));
}

#[tokio::test]
async fn evicted_settings_fall_back_until_reloaded() {
    let store = SettingsStore::in_memory().await.expect("store");
    store.save(&key(), &custom()).await.expect("save");
    assert_eq!(store.cached(&key()), custom());

    store.evict(&key());
    assert_eq!(store.cached(&key()), TenantSettings::default());

    store.reload(&key()).await.expect("reload");
    assert_eq!(store.cached(&key()), custom());
}

#[tokio::test]
async fn sessions_are_listed_in_key_order() {
    let store = SettingsStore::in_memory().await.expect("store");
    let later = SessionKey::new("globex", "+1");
    let first = SessionKey::new("acme", "+2");
    let second = SessionKey::new("acme", "+3");

    store.set_authenticated(&later, true).await.expect("flag");
    store.set_authenticated(&second, false).await.expect("flag");
    store.set_authenticated(&first, true).await.expect("flag");

    let sessions = store.sessions().await.expect("list");
    assert_eq!(
        sessions,
        vec![(first, true), (second, false), (later, true)]
    );
}

#[tokio::test]
async fn flag_updates_replace_the_previous_value() {
    let store = SettingsStore::in_memory().await.expect("store");
    store.set_authenticated(&key(), true).await.expect("flag");
    store.set_authenticated(&key(), false).await.expect("flag");

    assert!(!store.is_authenticated(&key()).await.expect("flag"));
    assert_eq!(store.sessions().await.expect("list").len(), 1);
}

#[test]
fn partial_settings_json_fills_defaults() {
    let settings: TenantSettings =
        serde_json::from_str(r#"{"group_name":"Team"}"#).expect("decodes");
    assert_eq!(settings.group_name.as_deref(), Some("Team"));
    assert!(settings.ai_enabled);
    assert!(settings.questions.is_empty());
    assert_eq!(settings.effective_questions().len(), 3);
}
