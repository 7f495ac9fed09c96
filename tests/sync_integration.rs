mod common;

use assert_matches::assert_matches;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

use common::*;
use settings_sync::sync::SyncPhase;
use settings_sync::{FileOutcome, InstallOutcome, Provisioning, SyncError, SyncedFile};

const CONTENTS_ROUTE: &str = r"^/repos/octocat/octocat-VSCode-Settings-Sync/contents/.+$";

async fn mount_writes_everywhere(env: &TestEnvironment) {
    Mock::given(method("PUT"))
        .and(path_regex(CONTENTS_ROUTE))
        .respond_with(ResponseTemplate::new(201).set_body_json(written_body("new-sha")))
        .mount(&env.server)
        .await;
}

fn seed_local_editor(env: &TestEnvironment) {
    env.write_user_file("settings.json", r#"{"editor.fontSize": 14}"#);
    env.write_user_file("keybindings.json", r#"[{"key": "ctrl+k", "command": "noop"}]"#);
    env.add_extension(
        "publisher.ext-1.0.0",
        r#"{"name": "ext", "publisher": "publisher", "version": "1.0.0"}"#,
    );
}

#[tokio::test]
async fn test_push_creates_repository_and_uploads_everything() {
    let env = TestEnvironment::new().await;
    env.login();
    seed_local_editor(&env);
    mount_user(&env.server).await;
    mount_create(&env.server, 201).await;
    mount_writes_everywhere(&env).await;

    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();

    assert_matches!(report.provisioning, Provisioning::Created);
    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.successful_files(), 3);
    for outcome in &report.files {
        assert_matches!(outcome, FileOutcome::Uploaded { updated: false, .. });
    }

    let puts = env.requests("PUT").await;
    assert_eq!(puts.len(), 3);
    assert!(puts.iter().all(|put| json_body(put).get("sha").is_none()));

    // Staging copies are gone, the live editor files are not
    for file in SyncedFile::ALL {
        assert!(!env.path("staging").join(file.remote_path()).exists());
    }
    assert!(env.path("User/settings.json").exists());
}

#[tokio::test]
async fn test_push_manifest_lists_scanned_extensions() {
    let env = TestEnvironment::new().await;
    env.login();
    seed_local_editor(&env);
    mount_user(&env.server).await;
    mount_create(&env.server, 201).await;
    mount_writes_everywhere(&env).await;

    env.engine(RecordingInstaller::default()).push().await.unwrap();

    let manifest_put = env
        .requests("PUT")
        .await
        .into_iter()
        .find(|put| put.url.path() == contents_path(SyncedFile::ExtensionManifest))
        .expect("manifest uploaded");
    let encoded = json_body(&manifest_put)["content"].as_str().unwrap().to_string();
    let decoded = BASE64.decode(encoded).unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(
        manifest["publisher.ext-1.0.0"]["url"],
        "https://marketplace.visualstudio.com/items?itemName=publisher.ext"
    );
}

#[tokio::test]
async fn test_push_into_existing_repository_updates_with_markers() {
    let env = TestEnvironment::new().await;
    env.login();
    seed_local_editor(&env);
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    mount_remote_file(&env.server, SyncedFile::Settings, b"{}", "old-settings-sha").await;
    mount_writes_everywhere(&env).await;

    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();

    assert_matches!(report.provisioning, Provisioning::AlreadyExists);
    assert_eq!(report.successful_files(), 3);
    assert_matches!(
        report.outcome(SyncedFile::Settings),
        Some(FileOutcome::Uploaded { updated: true, .. })
    );

    let settings_put = env
        .requests("PUT")
        .await
        .into_iter()
        .find(|put| put.url.path() == contents_path(SyncedFile::Settings))
        .expect("settings uploaded");
    assert_eq!(json_body(&settings_put)["sha"], "old-settings-sha");
}

#[tokio::test]
async fn test_push_skips_missing_local_files() {
    let env = TestEnvironment::new().await;
    env.login();
    env.write_user_file("settings.json", "{}");
    std::fs::remove_dir_all(env.path("extensions")).unwrap();
    mount_user(&env.server).await;
    mount_create(&env.server, 201).await;
    mount_writes_everywhere(&env).await;

    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();

    assert_eq!(report.successful_files(), 1);
    assert_eq!(report.skipped_files(), 2);
    assert_matches!(
        report.outcome(SyncedFile::Keybindings),
        Some(FileOutcome::Skipped { .. })
    );
    assert_eq!(env.requests("PUT").await.len(), 1);
}

#[tokio::test]
async fn test_push_staging_in_user_dir_keeps_live_files() {
    let env = TestEnvironment::new().await;
    env.login();
    seed_local_editor(&env);
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    mount_writes_everywhere(&env).await;

    let mut config = env.config();
    config.sync.staging_dir = env.path("User").to_string_lossy().into_owned();

    let report = env
        .engine_with(config, RecordingInstaller::default())
        .push()
        .await
        .unwrap();

    assert_eq!(report.successful_files(), 3);
    assert_eq!(
        std::fs::read_to_string(env.path("User/settings.json")).unwrap(),
        r#"{"editor.fontSize": 14}"#
    );
    assert!(env.path("User/keybindings.json").exists());
    // Not an editor file, so its staging copy is still cleaned up
    assert!(!env.path("User/extensions-list.json").exists());
}

#[tokio::test]
async fn test_push_retries_once_after_conflict() {
    let env = TestEnvironment::new().await;
    env.login();
    env.write_user_file("settings.json", "{}");
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    mount_remote_file(&env.server, SyncedFile::Settings, b"{}", "head").await;
    Mock::given(method("PUT"))
        .and(path(contents_path(SyncedFile::Settings)))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "conflict" })))
        .up_to_n_times(1)
        .mount(&env.server)
        .await;
    mount_writes_everywhere(&env).await;

    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();

    assert_matches!(
        report.outcome(SyncedFile::Settings),
        Some(FileOutcome::Uploaded { updated: true, .. })
    );
    let settings_reads = env
        .requests("GET")
        .await
        .into_iter()
        .filter(|get| get.url.path() == contents_path(SyncedFile::Settings))
        .count();
    assert_eq!(settings_reads, 2);
}

#[tokio::test]
async fn test_push_persistent_conflict_is_reported_not_fatal() {
    let env = TestEnvironment::new().await;
    env.login();
    seed_local_editor(&env);
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    Mock::given(method("PUT"))
        .and(path(contents_path(SyncedFile::Settings)))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "conflict" })))
        .mount(&env.server)
        .await;
    mount_writes_everywhere(&env).await;

    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();

    assert_matches!(
        report.outcome(SyncedFile::Settings),
        Some(FileOutcome::Failed { error: SyncError::Conflict { .. }, .. })
    );
    assert_eq!(report.successful_files(), 2);
    assert_eq!(report.failed_files(), 1);
    // The staging copy of a failed upload is kept
    assert!(env.path("staging/settings.json").exists());
}

#[tokio::test]
async fn test_push_waits_out_rate_limit() {
    let env = TestEnvironment::new().await;
    env.login();
    env.write_user_file("settings.json", "{}");
    mount_user(&env.server).await;

    let reset = chrono::Utc::now().timestamp() + 2;
    Mock::given(method("POST"))
        .and(path("/user/repos"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset", reset.to_string().as_str())
                .set_body_json(json!({ "message": "API rate limit exceeded" })),
        )
        .up_to_n_times(1)
        .mount(&env.server)
        .await;
    mount_create(&env.server, 201).await;
    mount_writes_everywhere(&env).await;

    let started = Instant::now();
    let report = env.engine(RecordingInstaller::default()).push().await.unwrap();
    let elapsed = started.elapsed();

    assert_matches!(report.provisioning, Provisioning::Created);
    assert!(elapsed >= Duration::from_secs(1), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
    assert_eq!(env.requests("POST").await.len(), 2);
}

#[tokio::test]
async fn test_push_gives_up_after_rate_limit_retries() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    Mock::given(method("POST"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .mount(&env.server)
        .await;

    let mut config = env.config();
    config.github.max_rate_limit_retries = 2;

    let result = env.engine_with(config, RecordingInstaller::default()).push().await;

    assert_matches!(result, Err(SyncError::RateLimited { attempts: 3 }));
    assert_eq!(env.requests("POST").await.len(), 3);
    assert!(env.requests("PUT").await.is_empty());
}

#[tokio::test]
async fn test_rate_limit_wait_is_cancelled_by_timeout() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    Mock::given(method("POST"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
        .mount(&env.server)
        .await;

    let mut config = env.config();
    config.github.max_backoff_secs = 60;
    config.sync.timeout = 1;

    let started = Instant::now();
    let result = env.engine_with(config, RecordingInstaller::default()).push().await;

    assert_matches!(result, Err(SyncError::Timeout(1)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_provisioning_failure_aborts_push() {
    let env = TestEnvironment::new().await;
    env.login();
    env.write_user_file("settings.json", "{}");
    mount_user(&env.server).await;
    Mock::given(method("POST"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "down" })))
        .mount(&env.server)
        .await;

    let result = env.engine(RecordingInstaller::default()).push().await;

    assert_matches!(result, Err(SyncError::Api { status: 500, .. }));
    assert!(env.requests("PUT").await.is_empty());
}

#[tokio::test]
async fn test_pull_installs_extensions_from_manifest() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    mount_remote_file(
        &env.server,
        SyncedFile::Settings,
        br#"{"workbench.colorTheme": "Monokai"}"#,
        "s1",
    )
    .await;
    let manifest = json!({
        "publisher.ext-1.0.0": {
            "url": "https://marketplace.visualstudio.com/items?itemName=publisher.ext",
            "version": "1.0.0",
            "publisher": "publisher",
            "description": "N/A",
            "repository": "N/A",
            "categories": []
        }
    });
    mount_remote_file(
        &env.server,
        SyncedFile::ExtensionManifest,
        manifest.to_string().as_bytes(),
        "m1",
    )
    .await;

    let installer = RecordingInstaller::default();
    let report = env.engine(installer.clone()).pull().await.unwrap();

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(installer.installed(), vec!["publisher.ext".to_string()]);
    assert_eq!(report.installed_extensions(), vec!["publisher.ext"]);

    assert_eq!(
        std::fs::read_to_string(env.path("User/settings.json")).unwrap(),
        r#"{"workbench.colorTheme": "Monokai"}"#
    );
    assert!(env.path("pulled/extensions-list.json").exists());
    assert_matches!(
        report.outcome(SyncedFile::Keybindings),
        Some(FileOutcome::Skipped { .. })
    );
    assert_eq!(report.successful_files(), 2);
}

#[tokio::test]
async fn test_pull_with_nothing_remote_still_completes() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    mount_create(&env.server, 201).await;

    let installer = RecordingInstaller::default();
    let report = env.engine(installer.clone()).pull().await.unwrap();

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.skipped_files(), 3);
    assert!(report.installs.is_empty());
    assert!(installer.installed().is_empty());
}

#[tokio::test]
async fn test_pull_falls_back_to_lossy_decoding() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    mount_remote_file(&env.server, SyncedFile::Keybindings, b"[\xff]", "k1").await;

    let report = env.engine(RecordingInstaller::default()).pull().await.unwrap();

    assert_matches!(
        report.outcome(SyncedFile::Keybindings),
        Some(FileOutcome::Downloaded { lossy: true, .. })
    );
    assert_eq!(
        std::fs::read_to_string(env.path("User/keybindings.json")).unwrap(),
        "[\u{FFFD}]"
    );
}

#[tokio::test]
async fn test_pull_install_failure_does_not_block_others() {
    let env = TestEnvironment::new().await;
    env.login();
    mount_user(&env.server).await;
    mount_create(&env.server, 422).await;
    let manifest = json!({
        "alpha.one-1.0.0": { "url": "https://marketplace.visualstudio.com/items?itemName=alpha.one" },
        "beta.two-2.0.0": { "url": "https://marketplace.visualstudio.com/items?itemName=beta.two" },
        "mystery": {}
    });
    mount_remote_file(
        &env.server,
        SyncedFile::ExtensionManifest,
        manifest.to_string().as_bytes(),
        "m1",
    )
    .await;

    let installer = RecordingInstaller::failing_on(&["alpha.one"]);
    let report = env.engine(installer.clone()).pull().await.unwrap();

    assert_eq!(installer.installed(), vec!["beta.two".to_string()]);
    assert_eq!(report.failed_installs(), 1);
    assert!(report
        .installs
        .iter()
        .any(|o| matches!(o, InstallOutcome::Skipped { folder, .. } if folder == "mystery")));
}

#[tokio::test]
async fn test_pull_with_rejected_token_aborts() {
    let env = TestEnvironment::new().await;
    env.login();
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Bad credentials" })))
        .mount(&env.server)
        .await;

    let result = env.engine(RecordingInstaller::default()).pull().await;

    assert_matches!(result, Err(SyncError::Auth(_)));
    assert!(env.requests("POST").await.is_empty());
}
