use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use dirshare::{mode, Mode, Root, ServeConfig};
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use serde_json::Value;
use std::{fs, io::Cursor, io::Read};
use tempfile::TempDir;
use tower::ServiceExt;

fn file_manager() -> (TempDir, Router) {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path();
    fs::create_dir_all(base.join("docs")).unwrap();
    fs::create_dir_all(base.join("Photos")).unwrap();
    fs::write(base.join("docs/readme.txt"), b"read me please").unwrap();
    fs::write(base.join("b.txt"), b"bee").unwrap();
    fs::write(base.join(".hidden"), b"secret").unwrap();
    RgbImage::from_fn(300, 150, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 40]))
        .save(base.join("a.png"))
        .unwrap();

    let root = Root::new(base).unwrap();
    assert_eq!(mode::detect(&root), Mode::FileManager);
    let router = dirshare::router(ServeConfig::new(root, Mode::FileManager));
    (temp_dir, router)
}

fn web_app() -> (TempDir, Router) {
    let temp_dir = tempfile::tempdir().unwrap();
    let base = temp_dir.path();
    fs::create_dir_all(base.join("assets")).unwrap();
    fs::create_dir_all(base.join("blog")).unwrap();
    fs::write(base.join("index.html"), b"<h1>home</h1>").unwrap();
    fs::write(base.join("assets/app.js"), b"console.log(1);").unwrap();
    fs::write(base.join("blog/index.htm"), b"<h1>blog</h1>").unwrap();

    let root = Root::new(base).unwrap();
    let mode = mode::detect(&root);
    assert!(matches!(mode, Mode::WebApp { .. }));
    let router = dirshare::router(ServeConfig::new(root, mode));
    (temp_dir, router)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

async fn post_download(router: &Router, body: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/download")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn error_kind(body: &[u8]) -> String {
    let value: Value = serde_json::from_slice(body).unwrap();
    value["error"]["kind"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_browse_root_lists_directories_first() {
    let (_temp_dir, router) = file_manager();
    let (status, headers, body) = get(&router, "/browse").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");

    let entries: Vec<Value> = serde_json::from_slice(&body).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["docs", "Photos", "a.png", "b.txt"]);
    assert_eq!(entries[0]["kind"], "directory");
    assert_eq!(entries[2]["kind"], "image");
    assert_eq!(entries[2]["hasPreview"], true);
    assert_eq!(entries[3]["hasPreview"], false);
    assert_eq!(entries[3]["size"], 3);
}

#[tokio::test]
async fn test_browse_subdirectory() {
    let (_temp_dir, router) = file_manager();
    let (status, _, body) = get(&router, "/browse/docs").await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["path"], "docs/readme.txt");
    assert_eq!(entries[0]["kind"], "document");
}

#[tokio::test]
async fn test_browse_errors() {
    let (_temp_dir, router) = file_manager();

    let (status, _, body) = get(&router, "/browse/..%2F..%2Fetc").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&body), "PathEscape");

    let (status, _, body) = get(&router, "/browse/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "NotFound");

    let (status, _, _) = get(&router, "/browse/b.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_preview_returns_bounded_jpeg() {
    let (_temp_dir, router) = file_manager();
    let (status, headers, body) = get(&router, "/preview/a.png?size=100").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");

    let decoded = image::load_from_memory(&body).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (100, 50));
}

#[tokio::test]
async fn test_preview_rejects_non_media() {
    let (_temp_dir, router) = file_manager();
    let (status, _, body) = get(&router, "/preview/b.txt").await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(error_kind(&body), "UnsupportedType");

    let (status, _, _) = get(&router, "/preview/nope.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_streams_zip() {
    let (_temp_dir, router) = file_manager();
    let (status, headers, body) = post_download(&router, r#"["b.txt", "docs"]"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
    assert!(headers.get(header::CONTENT_LENGTH).is_none());
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment; filename="));

    let mut zip = zip::ZipArchive::new(Cursor::new(body)).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["b.txt", "docs/readme.txt"]);

    let mut contents = String::new();
    zip.by_name("docs/readme.txt")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents, "read me please");
}

#[tokio::test]
async fn test_download_accepts_form_post() {
    let (_temp_dir, router) = file_manager();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/download")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("paths=%5B%22b.txt%22%2C%22docs%22%5D"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    let body = response.into_body().collect().await.unwrap().to_bytes();

    let zip = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
    let names: Vec<&str> = zip.file_names().collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"b.txt") && names.contains(&"docs/readme.txt"));
}

#[tokio::test]
async fn test_download_form_rejects_bad_paths_field() {
    let (_temp_dir, router) = file_manager();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/download")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("paths=b.txt"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_download_single_directory_names_archive() {
    let (_temp_dir, router) = file_manager();
    let (status, headers, _) = post_download(&router, r#"["docs"]"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("filename=\"docs.zip\""));
}

#[tokio::test]
async fn test_download_rejects_bad_selections() {
    let (_temp_dir, router) = file_manager();

    let (status, _, body) = post_download(&router, "[]").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "EmptySelection");

    let (status, _, body) = post_download(&router, "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "BadRequest");

    let (status, _, body) = post_download(&router, r#"["b.txt", "../outside"]"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&body), "PathEscape");

    let (status, _, body) = post_download(&router, r#"["missing.txt"]"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "NotFound");
}

#[tokio::test]
async fn test_raw_serves_file_inline_or_attachment() {
    let (_temp_dir, router) = file_manager();

    let (status, headers, body) = get(&router, "/raw/docs/readme.txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "14");
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("inline"));
    assert_eq!(body, b"read me please");

    let (status, headers, _) = get(&router, "/raw/b.txt?download=1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .starts_with("attachment"));

    let (status, _, _) = get(&router, "/raw/docs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_file_manager_page_renders() {
    let (_temp_dir, router) = file_manager();

    let (status, headers, body) = get(&router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let page = String::from_utf8(body).unwrap();
    assert!(page.contains("/files/docs"));
    assert!(page.contains("/preview/a.png?size="));
    assert!(page.contains("/raw/b.txt"));
    assert!(page.contains(r#"action="/download""#));
    assert!(page.contains(r#"name="paths""#));
    assert!(!page.contains(".hidden"));

    let (status, _, _) = get(&router, "/files/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_web_app_serves_entry_and_assets() {
    let (_temp_dir, router) = web_app();

    let (status, headers, body) = get(&router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(body, b"<h1>home</h1>");

    let (status, _, body) = get(&router, "/assets/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"console.log(1);");

    let (status, _, body) = get(&router, "/blog").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>blog</h1>");
}

#[tokio::test]
async fn test_web_app_errors() {
    let (_temp_dir, router) = web_app();

    let (status, _, _) = get(&router, "/missing.css").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&router, "/assets").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&router, "/..%2F..%2Fetc%2Fpasswd").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_kind(&body), "PathEscape");

    // File manager endpoints don't exist in web-app mode.
    let (status, _, _) = get(&router, "/browse").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
