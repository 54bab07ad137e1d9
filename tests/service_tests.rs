//! End-to-end tests for the image service.
//!
//! The external `identify` and `guetzli` binaries are replaced with small
//! shell stubs so the whole pipeline runs hermetically: upload over the
//! router, watch the job reach a terminal state through the meta endpoint,
//! download the result.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use guetzli_service::api::routes::create_router;
use guetzli_service::api::server::AppState;
use guetzli_service::janitor::Janitor;
use guetzli_service::job::JobCoordinator;
use guetzli_service::probe::QualityProbe;
use guetzli_service::store::meta::{ImageType, ProcessStatus};
use guetzli_service::store::ImageStore;
use guetzli_service::transform::GuetzliTransformer;

fn write_stub(dir: &TempDir, name: &str, script: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

struct TestService {
    _dir: TempDir,
    store: Arc<ImageStore>,
    coordinator: Arc<JobCoordinator>,
    app: Router,
}

/// Service wired to a probe stub reporting quality 87 and a recompressor
/// stub running `transform_script` with the usual
/// `--memlimit 6000 <source> <target>` arguments.
fn test_service(transform_script: &str) -> TestService {
    let dir = TempDir::new().unwrap();
    let identify = write_stub(&dir, "identify-stub", "#!/bin/sh\necho 87\n");
    let guetzli = write_stub(&dir, "guetzli-stub", transform_script);
    let store = Arc::new(ImageStore::open(Some(dir.path().join("data"))).unwrap());
    let coordinator = JobCoordinator::new(
        Arc::clone(&store),
        QualityProbe::with_command(identify),
        GuetzliTransformer::with_command(guetzli),
    );
    let app = create_router(AppState::new(Arc::clone(&store), Arc::clone(&coordinator)));
    TestService {
        _dir: dir,
        store,
        coordinator,
        app,
    }
}

async fn get(app: &Router, uri: &str) -> Response {
    app.clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn poll_until_terminal(app: &Router, content_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let response = get(app, &format!("/image/{content_id}/meta")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let status = body["status"].as_str().unwrap();
        if status == "transformed" || status == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job for {content_id} did not reach a terminal state");
}

fn location_id(response: &Response) -> String {
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    let id = location
        .strip_prefix("/image/")
        .and_then(|rest| rest.strip_suffix("/source"))
        .unwrap()
        .to_string();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    id
}

#[tokio::test]
async fn happy_path_jpeg_upload_to_download() {
    let service = test_service("#!/bin/sh\ncp \"$3\" \"$4\"\n");

    let upload = service
        .app
        .clone()
        .oneshot(
            Request::post("/image")
                .header(header::CONTENT_TYPE, "image/jpeg")
                .header("X-Guetzli-Img-Name", "photo.jpg")
                .body(Body::from("jpeg source bytes"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::CREATED);
    let id = location_id(&upload);

    let meta = poll_until_terminal(&service.app, &id).await;
    assert_eq!(meta["status"], "transformed");
    assert_eq!(meta["contentId"], id);
    assert_eq!(meta["source"]["name"], "photo.jpg");
    assert_eq!(meta["source"]["mime"], "image/jpeg");
    assert_eq!(meta["source"]["qualitylevel"], 87);
    assert_eq!(meta["source"]["size"], 17);
    assert_eq!(meta["target"]["qualitylevel"], 87);
    assert_eq!(meta["target"]["size"], 17);

    let source = get(&service.app, &format!("/image/{id}/source?download=true")).await;
    assert_eq!(source.status(), StatusCode::OK);
    assert_eq!(
        source.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"photo.jpg\""
    );
    let bytes = axum::body::to_bytes(source.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"jpeg source bytes");

    let target = get(&service.app, &format!("/image/{id}/target")).await;
    assert_eq!(target.status(), StatusCode::OK);
    assert_eq!(
        target.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/jpeg"
    );
}

#[tokio::test]
async fn png_upload_records_quality_100() {
    let service = test_service("#!/bin/sh\ncp \"$3\" \"$4\"\n");

    let upload = service
        .app
        .clone()
        .oneshot(
            Request::post("/image")
                .header(header::CONTENT_TYPE, "image/png")
                .body(Body::from("png bytes"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::CREATED);
    let id = location_id(&upload);

    let meta = poll_until_terminal(&service.app, &id).await;
    assert_eq!(meta["status"], "transformed");
    assert_eq!(meta["source"]["mime"], "image/png");
    assert_eq!(meta["source"]["qualitylevel"], 100);
    assert!(service.store.target_path(&id).exists());
}

#[tokio::test]
async fn failed_transformation_is_reported_via_meta_only() {
    let service = test_service("#!/bin/sh\nexit 3\n");

    let upload = service
        .app
        .clone()
        .oneshot(
            Request::post("/image")
                .header(header::CONTENT_TYPE, "image/jpeg")
                .body(Body::from("jpeg"))
                .unwrap(),
        )
        .await
        .unwrap();
    // the client never sees the subprocess failure at submission time
    assert_eq!(upload.status(), StatusCode::CREATED);
    let id = location_id(&upload);

    let meta = poll_until_terminal(&service.app, &id).await;
    assert_eq!(meta["status"], "failed");
    assert!(meta.get("target").is_none());

    let target = get(&service.app, &format!("/image/{id}/target")).await;
    assert_eq!(target.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn at_most_two_entries_transform_concurrently() {
    // a slow recompressor keeps the slots busy long enough to observe
    let service = test_service("#!/bin/sh\nsleep 0.4\ncp \"$3\" \"$4\"\n");

    let mut ids = Vec::new();
    for i in 0..5 {
        let body = format!("jpeg bytes {i}");
        let id = service
            .coordinator
            .submit(body.into_bytes().into(), "image/jpeg", None)
            .await
            .unwrap();
        ids.push(id);
    }

    let mut max_transforming = 0usize;
    let mut all_terminal = false;
    for _ in 0..1000 {
        let mut transforming = 0usize;
        let mut terminal = 0usize;
        for id in &ids {
            match service.store.read_meta(id).await.unwrap().status {
                ProcessStatus::Transforming => transforming += 1,
                status if status.is_terminal() => terminal += 1,
                _ => {}
            }
        }
        max_transforming = max_transforming.max(transforming);
        if terminal == ids.len() {
            all_terminal = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(all_terminal, "jobs did not all reach a terminal state");

    assert!(
        max_transforming <= 2,
        "observed {max_transforming} concurrent transformations"
    );
    for id in &ids {
        let meta = service.store.read_meta(id).await.unwrap();
        assert_eq!(meta.status, ProcessStatus::Transformed);
    }
}

#[tokio::test]
async fn janitor_sweep_removes_expired_entries_from_listing() {
    let service = test_service("#!/bin/sh\ncp \"$3\" \"$4\"\n");

    // an entry admitted 25 hours ago, written as the store would have left it
    let old = service.store.admit(b"old", ImageType::Jpg).await.unwrap();
    let mut meta = guetzli_service::store::meta::ImageMetadata {
        content_id: old.clone(),
        status: ProcessStatus::Failed,
        stored_datetime: chrono::Local::now().naive_local() - chrono::Duration::hours(25),
        source_name: None,
        source_type: ImageType::Jpg,
        source_quality: 87,
        source_size: 3,
        target_quality: None,
        target_size: None,
    };
    service.store.write_meta(&meta).await.unwrap();

    let fresh = service.store.admit(b"new", ImageType::Jpg).await.unwrap();
    meta.content_id = fresh.clone();
    meta.stored_datetime = chrono::Local::now().naive_local();
    service.store.write_meta(&meta).await.unwrap();

    Janitor::new(Arc::clone(&service.store)).sweep().await;

    let listing = body_json(get(&service.app, "/image").await).await;
    let ids: Vec<&str> = listing["ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(!ids.contains(&old.as_str()));
    assert!(ids.contains(&fresh.as_str()));

    let response = get(&service.app, &format!("/image/{old}/meta")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
