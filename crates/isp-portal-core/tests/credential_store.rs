mod common;

use std::sync::Arc;

use common::{CountingBackend, FailingBackend, ReadOnlyBackend};
use isp_portal_core::auth::{
    AuthError, ClearOptions, Credential, CredentialStore, Identity, Invalidation, SaveOutcome,
    IDENTITY_KEY, TOKEN_KEY,
};
use isp_portal_core::storage::{FileBackend, MemoryBackend, StorageBackend};

fn session() -> Arc<dyn StorageBackend> {
    Arc::new(MemoryBackend::session())
}

#[tokio::test]
async fn save_then_load_returns_identical_pair() {
    let primary = Arc::new(MemoryBackend::new("primary"));
    let store = CredentialStore::new(vec![primary.clone()], session());
    let credential = Credential::new("abc.def.ghi", Identity::new("u1"));

    store.save(credential.clone()).await;
    let loaded = store.load().await.unwrap();
    assert_eq!(*loaded, credential);

    // A fresh store over the same backend reads the same pair from storage
    let reopened = CredentialStore::new(vec![primary], session());
    assert_eq!(*reopened.load().await.unwrap(), credential);
}

#[tokio::test]
async fn clear_twice_leaves_storage_empty_and_succeeds() {
    let primary = Arc::new(MemoryBackend::new("primary"));
    let store = CredentialStore::new(vec![primary.clone()], session());
    store
        .save(Credential::new("abc.def.ghi", Identity::new("u1")))
        .await;

    let first = store.clear().await;
    assert!(first.success);
    assert!(primary.is_empty());

    let second = store.clear_with(ClearOptions { force: false }).await;
    assert!(second.success);
    assert!(second.errors.is_empty());
    assert!(primary.is_empty());
    assert!(store.load().await.is_none());
}

#[tokio::test]
async fn malformed_values_load_as_absent() {
    let cases: &[(Option<&str>, Option<&str>)] = &[
        (Some("abc.def.ghi"), None),
        (None, Some(r#"{"username":"u1"}"#)),
        (Some("abc.def.ghi"), Some("not json")),
        (Some("abc.def.ghi"), Some(r#""u1""#)),
        (Some("abc.def.ghi"), Some(r#"{"username":"   "}"#)),
        (Some("abc.def.ghi"), Some(r#"{"email":"u1@example.com"}"#)),
        (Some(""), Some(r#"{"username":"u1"}"#)),
        (Some("abc def"), Some(r#"{"username":"u1"}"#)),
    ];

    for (token, identity) in cases {
        let backend = Arc::new(MemoryBackend::new("primary"));
        if let Some(token) = token {
            backend.set(TOKEN_KEY, token).await.unwrap();
        }
        if let Some(identity) = identity {
            backend.set(IDENTITY_KEY, identity).await.unwrap();
        }
        let store = CredentialStore::new(vec![backend], session());
        assert!(
            store.load().await.is_none(),
            "expected absent for token={:?} identity={:?}",
            token,
            identity
        );
        assert!(!store.is_authenticated().await);
    }
}

#[tokio::test]
async fn failing_primary_falls_back_to_secondary() {
    let secondary = Arc::new(MemoryBackend::new("secondary"));
    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(FailingBackend), secondary.clone()];
    let store = CredentialStore::new(backends.clone(), session());

    let outcome = store
        .save(Credential::new("abc.def.ghi", Identity::new("u1")))
        .await;
    assert_eq!(outcome, SaveOutcome::Durable { backend: "secondary" });

    let reopened = CredentialStore::new(backends, session());
    assert_eq!(reopened.load().await.unwrap().username(), "u1");

    // Clearing still succeeds in forced mode, with the failure reported
    let report = reopened.clear().await;
    assert!(report.success);
    assert!(report.errors.iter().any(|e| e.starts_with("failing:")));
    assert!(secondary.is_empty());
}

#[tokio::test]
async fn non_forced_clear_reports_failure() {
    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(FailingBackend)];
    let store = CredentialStore::new(backends, session());
    let report = store.clear_with(ClearOptions { force: false }).await;
    assert!(!report.success);
    assert!(!report.errors.is_empty());
}

#[tokio::test]
async fn all_backends_failing_keeps_credential_in_memory() {
    let backends: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(FailingBackend), Arc::new(FailingBackend)];
    let store = CredentialStore::new(backends, session());

    let outcome = store
        .save(Credential::new("abc.def.ghi", Identity::new("u1")))
        .await;
    assert_eq!(outcome, SaveOutcome::Volatile);
    assert_eq!(store.load().await.unwrap().token(), "abc.def.ghi");
    assert!(store.is_authenticated().await);

    store.clear().await;
    assert!(store.load().await.is_none());
}

#[tokio::test]
async fn memory_only_credential_outlives_stale_stored_one() {
    let backends: Vec<Arc<dyn StorageBackend>> =
        vec![Arc::new(ReadOnlyBackend::holding("old.tok.en", "old_user").await)];
    let store = CredentialStore::new(backends, session());
    assert_eq!(store.load().await.unwrap().username(), "old_user");

    let outcome = store
        .save(Credential::new("new.tok.en", Identity::new("new_user")))
        .await;
    assert_eq!(outcome, SaveOutcome::Volatile);

    let loaded = store.load().await.unwrap();
    assert_eq!(loaded.username(), "new_user");
    assert_eq!(loaded.token(), "new.tok.en");
    assert_eq!(store.current().await.unwrap().username(), "new_user");
}

#[tokio::test]
async fn concurrent_invalidations_clear_once_and_notify_once() {
    let counting = Arc::new(CountingBackend::new());
    let store = Arc::new(CredentialStore::new(vec![counting.clone()], session()));
    store
        .save(Credential::new("abc.def.ghi", Identity::new("u1")))
        .await;

    let notified = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = notified.clone();
    store.events().subscribe(move |failure| {
        assert_eq!(failure.username.as_deref(), Some("u1"));
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let results = futures::future::join_all((0..3).map(|_| {
        let store = store.clone();
        async move {
            store
                .invalidate("abc.def.ghi", AuthError::AuthRejected { status: 401 })
                .await
        }
    }))
    .await;

    let performed = results
        .iter()
        .filter(|r| matches!(r, Invalidation::Performed(_)))
        .count();
    assert_eq!(performed, 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| **r == Invalidation::AlreadyCleared)
            .count(),
        2
    );
    assert_eq!(notified.load(std::sync::atomic::Ordering::SeqCst), 1);

    let removes_after_first_clear = counting.removes();
    store.clear().await;
    assert_eq!(counting.removes(), removes_after_first_clear * 2);
}

#[tokio::test]
async fn file_backend_round_trips_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let backend = || -> Arc<dyn StorageBackend> {
        Arc::new(FileBackend::new(dir.path(), "https://saidawifi.com"))
    };

    let store = CredentialStore::new(vec![backend()], session());
    store
        .save(Credential::new("abc.def.ghi", Identity::new("u1")))
        .await;

    let reopened = CredentialStore::new(vec![backend()], session());
    assert_eq!(reopened.load().await.unwrap().username(), "u1");

    reopened.clear().await;
    let again = CredentialStore::new(vec![backend()], session());
    assert!(again.load().await.is_none());
}
