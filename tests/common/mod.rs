//! Local HTTP fixtures shared by the integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, StatusCode, Uri};
use futures_util::StreamExt;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serve `files` by exact request path (`/mods/a.jar`). Unknown paths are 404.
/// `/chunked` streams 20 bytes without a Content-Length. `/stall` announces
/// 1000 bytes, sends 10 and then never finishes.
pub async fn start_mock_server(files: HashMap<String, Vec<u8>>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    serve(listener, files);
    addr
}

/// Like [`start_mock_server`], for fixtures that embed their own URLs:
/// `build` receives the base URL (`http://127.0.0.1:<port>`).
pub async fn start_mock_server_with(
    build: impl FnOnce(&str) -> HashMap<String, Vec<u8>>,
) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    serve(listener, build(&base));
    base
}

fn serve(listener: tokio::net::TcpListener, files: HashMap<String, Vec<u8>>) {
    let files = Arc::new(files);
    let app = Router::new()
        .route(
            "/chunked",
            get(|| async {
                let chunks = vec![Ok::<_, std::io::Error>(vec![1u8; 10]), Ok(vec![2u8; 10])];
                Body::from_stream(futures_util::stream::iter(chunks))
            }),
        )
        .route(
            "/stall",
            get(|| async {
                let head = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(vec![7u8; 10])]);
                let body = Body::from_stream(head.chain(futures_util::stream::pending()));
                ([(header::CONTENT_LENGTH, "1000")], body)
            }),
        )
        .fallback(move |uri: Uri| {
            let files = files.clone();
            async move {
                match files.get(uri.path()) {
                    Some(body) => (StatusCode::OK, body.clone()).into_response(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
        });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// In-memory zip, entries written in the given order.
pub fn create_test_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let buf = std::io::Cursor::new(Vec::new());
    let mut zip_writer = zip::ZipWriter::new(buf);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    for (name, content) in entries {
        zip_writer.start_file(*name, options).unwrap();
        zip_writer.write_all(content).unwrap();
    }

    zip_writer.finish().unwrap().into_inner()
}
