mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use cloudfiles::api::{ApiError, FileRecord, FileUpdate, ShareRequest, SharePermission, UploadRequest};
use cloudfiles::cache::MemoryStore;
use cloudfiles::files::{FileManager, MoveOptions, Outcome};

use common::{loaded, FakeApi};

#[tokio::test]
async fn star_is_applied_and_confirmed() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    let outcome = manager.toggle_star("f1").await.unwrap();
    assert_eq!(outcome.completed(), Some(true));
    assert!(manager.file("f1").unwrap().is_starred);
    assert_eq!(api.server_file("f1").unwrap().is_starred, Some(true));

    let outcome = manager.toggle_star("f1").await.unwrap();
    assert_eq!(outcome.completed(), Some(false));
    assert!(!manager.file("f1").unwrap().is_starred);
}

#[tokio::test]
async fn failed_star_restores_the_exact_record() {
    let api = FakeApi::with_ids(&["f1", "f2"]);
    let manager = loaded(&api).await;
    let before = manager.files();

    api.fail_next("update_file", ApiError::Server(500, "boom".into()));
    let err = manager.toggle_star("f1").await.unwrap_err();

    assert!(matches!(err, ApiError::Server(500, _)));
    assert_eq!(manager.files(), before);
    assert!(manager.error("star_f1").unwrap().retryable);
}

#[tokio::test]
async fn rejected_toggle_is_not_recorded_as_retryable_error() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    api.fail_next("update_file", ApiError::BadRequest("nope".into()));
    assert!(manager.toggle_archive("f1").await.is_err());

    assert!(!manager.file("f1").unwrap().is_archived);
    assert!(manager.error("archive_f1").is_none());
}

#[tokio::test(start_paused = true)]
async fn star_times_out_and_rolls_back() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;
    let before = manager.file("f1").unwrap();

    api.set_delay(Duration::from_secs(20));
    let err = manager.toggle_star("f1").await.unwrap_err();

    assert!(matches!(err, ApiError::Timeout));
    assert_eq!(manager.file("f1").unwrap(), before);
    assert!(manager.error("star_f1").is_some());
}

#[tokio::test]
async fn toggling_an_unloaded_file_fails() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    assert!(matches!(
        manager.toggle_star("ghost").await,
        Err(ApiError::NotFound(_))
    ));
    assert_eq!(api.calls("update_file"), 0);
}

#[tokio::test]
async fn failed_edit_rolls_back_and_reports() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;
    let before = manager.file("f1").unwrap();

    api.fail_next("update_file", ApiError::BadRequest("name taken".into()));
    let update = FileUpdate {
        name: Some("renamed".into()),
        ..FileUpdate::default()
    };
    assert!(manager.edit_file("f1", update, false).await.is_err());

    assert_eq!(manager.file("f1").unwrap(), before);
    assert!(manager.error("edit_f1").is_some());
}

#[tokio::test(start_paused = true)]
async fn edit_is_visible_immediately_and_reloaded_later() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;
    let loads = api.calls("list_files");

    let update = FileUpdate {
        description: Some("quarterly numbers".into()),
        ..FileUpdate::default()
    };
    manager.edit_file("f1", update, true).await.unwrap();
    assert_eq!(
        manager.file("f1").unwrap().description.as_deref(),
        Some("quarterly numbers")
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(api.calls("list_files"), loads + 1);
    assert_eq!(
        manager.file("f1").unwrap().description.as_deref(),
        Some("quarterly numbers")
    );
}

#[tokio::test]
async fn bulk_delete_rolls_back_only_failed_files() {
    let api = FakeApi::with_ids(&["a", "b", "c"]);
    let manager = loaded(&api).await;
    let before_c = manager.file("c").unwrap();
    let loads = api.calls("list_files");

    api.fail_in_bulk("c");
    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let results = manager.bulk_delete(&ids).await;

    let outcome: Vec<(&str, bool)> = results
        .iter()
        .map(|r| (r.file_id.as_str(), r.success))
        .collect();
    assert_eq!(outcome, vec![("a", true), ("b", true), ("c", false)]);

    assert!(manager.file("a").unwrap().is_deleted());
    assert!(manager.file("b").unwrap().is_deleted());
    assert_eq!(manager.file("c").unwrap(), before_c);
    assert!(manager.error("bulk_delete").is_some());
    assert_eq!(api.calls("list_files"), loads);
}

#[tokio::test]
async fn bulk_delete_request_failure_rolls_back_everything() {
    let api = FakeApi::with_ids(&["a", "b"]);
    let manager = loaded(&api).await;
    let before = manager.files();

    api.fail_next("bulk_delete", ApiError::Network("connection reset".into()));
    let ids = vec!["a".to_string(), "b".to_string()];
    let results = manager.bulk_delete(&ids).await;

    assert!(results.iter().all(|r| !r.success));
    assert_eq!(manager.files(), before);
}

#[tokio::test]
async fn single_id_bulk_delete_uses_single_endpoint() {
    let api = FakeApi::with_ids(&["a"]);
    let manager = loaded(&api).await;

    let results = manager.bulk_delete(&["a".to_string()]).await;
    assert!(results[0].success);
    assert_eq!(api.calls("delete_file"), 1);
    assert_eq!(api.calls("bulk_delete"), 0);
    assert!(manager.file("a").unwrap().is_deleted());
}

#[tokio::test]
async fn delete_then_reload_hides_the_file() {
    let api = FakeApi::with_ids(&["a", "b"]);
    let manager = common::manager(&api);
    manager.load_files(Default::default()).await;

    manager.delete_file("a", false).await.unwrap();

    assert!(manager.file("a").is_none());
    assert_eq!(manager.files().len(), 1);
    assert!(api.server_file("a").unwrap().deleted_at.is_some());
}

#[tokio::test]
async fn failed_restore_keeps_deletion_timestamp() {
    let mut files = vec![common::raw("f1", "old")];
    files[0].deleted_at = Some(chrono::Utc::now());
    let api = FakeApi::new(files);
    let manager = loaded(&api).await;
    let before = manager.file("f1").unwrap();

    api.fail_next("restore_file", ApiError::Server(502, "bad gateway".into()));
    assert!(manager.restore_file("f1").await.is_err());

    assert_eq!(manager.file("f1").unwrap(), before);
    assert!(manager.error("restore_f1").is_some());

    manager.restore_file("f1").await.unwrap();
    assert!(!manager.file("f1").unwrap().is_deleted());
}

#[tokio::test]
async fn failed_purge_puts_the_record_back_in_place() {
    let api = FakeApi::with_ids(&["a", "b", "c"]);
    let manager = loaded(&api).await;
    let before = manager.files();

    api.fail_next("permanently_delete_file", ApiError::Forbidden("owner only".into()));
    assert!(manager.permanently_delete_file("b").await.is_err());
    assert_eq!(manager.files(), before);

    manager.permanently_delete_file("b").await.unwrap();
    assert!(manager.file("b").is_none());
    assert!(api.server_file("b").is_none());
}

fn pdf_upload(display_name: &str) -> UploadRequest {
    UploadRequest {
        file_name: "report.pdf".into(),
        content_type: "application/pdf".into(),
        bytes: b"%PDF".to_vec(),
        display_name: Some(display_name.into()),
        ..UploadRequest::default()
    }
}

#[tokio::test]
async fn repeated_upload_of_same_id_keeps_one_record() {
    let api = FakeApi::with_ids(&["f2"]);
    let manager = loaded(&api).await;

    api.set_upload_id("f1");
    manager.upload(pdf_upload("Report")).await.unwrap();

    // Inspect the merged list while the follow-up reload is parked
    api.set_upload_id("f1");
    let release = api.hold_next("list_files");
    let loads = api.calls("list_files");
    let before_reload = async {
        while api.calls("list_files") == loads {
            tokio::task::yield_now().await;
        }
        let files = manager.files();
        release.notify_one();
        files
    };
    let (result, merged) = tokio::join!(manager.upload(pdf_upload("Report v2")), before_reload);

    let record = result.unwrap().completed().unwrap();
    assert_eq!(record.id, "f1");
    assert_eq!(merged.iter().filter(|f| f.id == "f1").count(), 1);
    assert_eq!(merged.len(), 2);
    assert_eq!(
        merged.iter().find(|f| f.id == "f1").map(|f| f.name.as_str()),
        Some("Report v2")
    );
    assert_eq!(manager.files().len(), 2);
}

#[tokio::test]
async fn quota_error_without_snapshot_leaves_storage_alone() {
    let api = FakeApi::with_ids(&["f1"]);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let manager = FileManager::builder(api.clone(), Arc::new(MemoryStore::default()))
        .on_storage_update(move |quota| sink.lock().unwrap().push(*quota))
        .build();

    api.fail_next("upload_file", ApiError::from_status(413, "Payload Too Large"));
    api.fail_next("list_files", ApiError::Server(503, "maintenance".into()));
    let err = manager.upload(pdf_upload("Too big")).await.unwrap_err();

    assert!(matches!(err, ApiError::QuotaExceeded { storage: None, .. }));
    assert!(seen.lock().unwrap().is_empty());
    assert!(manager.quota().is_none());
    assert!(manager.error("upload").is_some());
}

#[tokio::test]
async fn empty_upload_is_rejected_locally() {
    let api = FakeApi::with_ids(&[]);
    let manager = loaded(&api).await;

    let request = UploadRequest {
        file_name: "empty.txt".into(),
        ..UploadRequest::default()
    };
    assert!(matches!(
        manager.upload(request).await,
        Err(ApiError::InvalidInput(_))
    ));
    assert_eq!(api.calls("upload_file"), 0);
}

#[tokio::test]
async fn move_runs_hooks_after_success() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    let folders_refreshed = Arc::new(AtomicBool::new(false));
    let refreshed = Arc::clone(&folders_refreshed);
    let moved_to = Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&moved_to);

    let options = MoveOptions {
        refresh_files: false,
        refresh_folders: Some(Box::new(move || {
            async move {
                refreshed.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        })),
        on_moved: Some(Box::new(move |record: &FileRecord| -> anyhow::Result<()> {
            *seen.lock().unwrap() = record.folder_id.clone();
            anyhow::bail!("hook failure is only logged")
        })),
    };

    let outcome = manager.move_file("f1", Some("folder-9"), options).await.unwrap();

    assert!(!outcome.is_queued());
    assert!(folders_refreshed.load(Ordering::SeqCst));
    assert_eq!(moved_to.lock().unwrap().as_deref(), Some("folder-9"));
    assert_eq!(manager.file("f1").unwrap().folder_id.as_deref(), Some("folder-9"));
}

#[tokio::test]
async fn failed_move_leaves_local_state_untouched() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    api.fail_next("move_file", ApiError::NotFound("folder".into()));
    let result = manager
        .move_file("f1", Some("folder-9"), MoveOptions::default())
        .await;

    assert!(result.is_err());
    assert_eq!(manager.file("f1").unwrap().folder_id, None);
    assert!(manager.error("move_f1").is_some());
}

#[tokio::test]
async fn duplicate_adds_the_copy_first() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    let copy = manager.duplicate("f1").await.unwrap();
    assert_eq!(copy.id, "f1-copy");
    assert_eq!(manager.files()[0].id, "f1-copy");
}

#[tokio::test]
async fn share_validates_the_address() {
    let api = FakeApi::with_ids(&["f1"]);
    let manager = loaded(&api).await;

    let bad = ShareRequest {
        user_email: "not-an-email".into(),
        permission: SharePermission::View,
        expires_at: None,
    };
    assert!(matches!(
        manager.share("f1", bad).await,
        Err(ApiError::InvalidInput(_))
    ));

    let good = ShareRequest {
        user_email: "ana@example.com".into(),
        permission: SharePermission::Edit,
        expires_at: None,
    };
    assert!(matches!(
        manager.share("f1", good).await,
        Ok(Outcome::Completed(()))
    ));
    assert_eq!(api.calls("share_file"), 1);
}
