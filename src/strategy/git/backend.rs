//! Local serving through `git http-backend`.
//!
//! Ready mirrors answer protocol requests from disk: the request is handed
//! to `git http-backend` over the CGI interface, its header block is parsed
//! and the remainder of stdout streams back as the response body.  The
//! repository read lock is held for the lifetime of the stream so a repack
//! or fetch cannot rewrite packs underneath an in-flight response.

use std::process::Stdio;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::gitclone::Repository;

use super::GitStrategy;

/// Git protocol operations recognised in request paths.
const GIT_OPERATIONS: &[&str] = &["/info/refs", "/git-upload-pack", "/git-receive-pack"];

#[allow(clippy::too_many_arguments)]
pub(super) async fn serve_from_backend(
    strategy: &Arc<GitStrategy>,
    repo: &Arc<Repository>,
    host: &str,
    path: &str,
    method: &Method,
    headers: &HeaderMap,
    raw_query: Option<&str>,
    body: Bytes,
) -> Response {
    let Some((repo_part, operation)) = split_git_operation(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let repo_part = repo_part.strip_suffix(".git").unwrap_or(repo_part);

    let mirror_root = match std::fs::canonicalize(&strategy.clone_manager.config().mirror_root) {
        Ok(root) => root,
        Err(err) => {
            error!(error = %err, "failed to resolve mirror root");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Mirrors are bare, so the CGI path is host/repo/<operation> directly.
    let path_info = format!("/{host}/{repo_part}{operation}");
    debug!(
        backend_path = %path_info,
        mirror = %repo.path().display(),
        "serving with git http-backend"
    );

    let mut cmd = Command::new("git");
    cmd.arg("http-backend");
    cmd.env_clear();
    cmd.env("PATH", std::env::var("PATH").unwrap_or_default());
    cmd.env("GIT_PROJECT_ROOT", &mirror_root);
    cmd.env("GIT_HTTP_EXPORT_ALL", "1");
    cmd.env("GATEWAY_INTERFACE", "CGI/1.1");
    cmd.env("SERVER_PROTOCOL", "HTTP/1.1");
    cmd.env("REMOTE_ADDR", "127.0.0.1");
    cmd.env("REQUEST_METHOD", method.as_str());
    cmd.env("PATH_INFO", &path_info);
    cmd.env("QUERY_STRING", raw_query.unwrap_or(""));
    cmd.env("CONTENT_LENGTH", body.len().to_string());
    if let Some(content_type) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
        cmd.env("CONTENT_TYPE", content_type);
    }
    if let Some(protocol) = headers.get("git-protocol").and_then(|v| v.to_str().ok()) {
        cmd.env("HTTP_GIT_PROTOCOL", protocol);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // Hold the read lock until the response body finishes streaming.
    let guard = repo.owned_read_guard().await;

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "failed to spawn git http-backend");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(&body).await {
            warn!(error = %err, "failed to write request body to git http-backend");
        }
        // Dropping stdin signals EOF.
    }

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            error!("git http-backend stdout not captured");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut reader = BufReader::new(stdout);

    let (status, response_headers) = match read_cgi_headers(&mut reader).await {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(backend_path = %path_info, error = %err, "failed to parse git http-backend response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Pump the remaining stdout into the response body, keeping the child,
    // the lock guard and the stderr pipe alive for the duration.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let mut stderr = child.stderr.take();
    let backend_path = path_info.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..read]))).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(backend_path = %backend_path, %status, "git http-backend exited with non-zero status");
            }
            Err(err) => error!(backend_path = %backend_path, error = %err, "failed to wait on git http-backend"),
            _ => {}
        }

        if let Some(stderr) = stderr.as_mut() {
            let mut message = Vec::new();
            if stderr.read_to_end(&mut message).await.is_ok() && !message.is_empty() {
                error!(
                    backend_path = %backend_path,
                    stderr = %String::from_utf8_lossy(&message).trim(),
                    "git http-backend error output"
                );
            }
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(out) = builder.headers_mut() {
        *out = response_headers;
    }
    builder
        .body(Body::from_stream(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        ))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Split a request path at the git protocol operation.
fn split_git_operation(path: &str) -> Option<(&str, &str)> {
    for operation in GIT_OPERATIONS {
        if let Some(index) = path.find(operation) {
            return Some((&path[..index], &path[index..]));
        }
    }
    None
}

/// Parse the CGI header block: `Header: value` lines up to a blank line,
/// with an optional `Status: <code> <reason>` pseudo-header.
async fn read_cgi_headers<R>(reader: &mut R) -> std::io::Result<(StatusCode, HeaderMap)>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();

    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(std::io::Error::other("CGI response ended before headers"));
        }
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok((status, headers));
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split_whitespace().next() {
                if let Ok(code) = code.parse::<u16>() {
                    status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
                }
            }
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_finds_the_operation() {
        assert_eq!(
            split_git_operation("org/repo/info/refs"),
            Some(("org/repo", "/info/refs"))
        );
        assert_eq!(
            split_git_operation("org/repo.git/git-upload-pack"),
            Some(("org/repo.git", "/git-upload-pack"))
        );
        assert_eq!(split_git_operation("org/repo"), None);
    }

    #[tokio::test]
    async fn cgi_headers_parse_status_and_fields() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\nExpires: Fri, 01 Jan 1980 00:00:00 GMT\r\n\r\nbody bytes";
        let mut reader = BufReader::new(&raw[..]);
        let (status, headers) = read_cgi_headers(&mut reader).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest[..], b"body bytes");
    }

    #[tokio::test]
    async fn cgi_headers_default_to_200() {
        let raw = b"Content-Type: application/x-git-upload-pack-advertisement\n\npayload";
        let mut reader = BufReader::new(&raw[..]);
        let (status, headers) = read_cgi_headers(&mut reader).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/x-git-upload-pack-advertisement"
        );
    }

    #[tokio::test]
    async fn truncated_header_block_is_an_error() {
        let raw = b"Content-Type: text/plain\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_cgi_headers(&mut reader).await.is_err());
    }
}
