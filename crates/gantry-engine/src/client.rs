//! Engine operation surface: containers, pods, images, volumes
//!
//! Thin typed operations over the call/monitor/tunnel layers. Payloads stay
//! [`serde_json::Value`]: this layer's contract is JSON values, and the
//! consumers own their shapes. The one typed decode is [`EngineEvent`] for
//! the event stream, since every consumer of that feed dispatches on the
//! event's type and action.

use std::time::Duration;

use serde_json::{json, Value};

use gantry_core::prelude::*;
use gantry_core::{EngineError, EngineEvent};

use crate::address::Scope;
use crate::connection::{self, Connection};
use crate::request::Request;
use crate::tunnel::Tunnel;

/// REST API version prefix every path carries.
pub const API_VERSION: &str = "v1.12";

/// The only timeout in this layer: the info probe, used to decide whether an
/// engine instance is reachable at all.
pub const INFO_TIMEOUT: Duration = Duration::from_millis(5000);

fn path(suffix: &str) -> String {
    format!("/{API_VERSION}/libpod{suffix}")
}

/// `true` when the exchange succeeded, `false` on a not-found answer;
/// anything else propagates. Backs the `exists` endpoints.
async fn exists(scope: Scope, request: Request) -> Result<bool> {
    match connection::call(scope, request).await {
        Ok(_) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Fetch engine info, racing a fixed 5 second timer.
///
/// The timer always fires or is dropped, never leaks, and no other
/// operation in this layer has any timeout.
pub async fn get_info(scope: Scope) -> Result<Value> {
    tokio::time::timeout(INFO_TIMEOUT, connection::call_json(scope, Request::get(path("/info"))))
        .await
        .map_err(|_| Error::Timeout(INFO_TIMEOUT))?
}

/// Stream engine events into `on_event` until the stream ends or the
/// Connection is closed.
///
/// For the raw record form use [`Connection::monitor_records`] directly.
pub async fn stream_events(
    connection: &mut Connection,
    mut on_event: impl FnMut(EngineEvent) -> Result<()>,
) -> Result<()> {
    connection
        .monitor_records(Request::get(path("/events")).param("stream", true), |record| {
            on_event(EngineEvent::from_value(record)?)
        })
        .await
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// List all containers, including stopped ones.
pub async fn get_containers(scope: Scope) -> Result<Value> {
    connection::call_json(scope, Request::get(path("/containers/json")).param("all", true)).await
}

pub async fn inspect_container(scope: Scope, id: &str) -> Result<Value> {
    connection::call_json(scope, Request::get(path(&format!("/containers/{id}/json")))).await
}

/// Create a container from a libpod spec; answers `{"Id": ..., "Warnings": []}`.
pub async fn create_container(scope: Scope, spec: &Value) -> Result<Value> {
    connection::call_json(scope, Request::post(path("/containers/create")).json_body(spec)).await
}

/// Post one lifecycle action: `start`, `stop`, `restart`, `pause`,
/// `unpause`, or `kill`.
pub async fn post_container(scope: Scope, id: &str, action: &str) -> Result<()> {
    connection::call(scope, Request::post(path(&format!("/containers/{id}/{action}")))).await?;
    Ok(())
}

pub async fn del_container(scope: Scope, id: &str, force: bool) -> Result<()> {
    connection::call(
        scope,
        Request::delete(path(&format!("/containers/{id}"))).param("force", force),
    )
    .await?;
    Ok(())
}

pub async fn rename_container(scope: Scope, id: &str, name: &str) -> Result<()> {
    connection::call(
        scope,
        Request::post(path(&format!("/containers/{id}/rename"))).param("name", name),
    )
    .await?;
    Ok(())
}

/// Commit a container's filesystem to a new image.
pub async fn commit_container(scope: Scope, id: &str, repo: &str, tag: &str) -> Result<Value> {
    connection::call_json(
        scope,
        Request::post(path("/commit"))
            .param("container", id)
            .param("repo", repo)
            .param("tag", tag),
    )
    .await
}

pub async fn container_exists(scope: Scope, id: &str) -> Result<bool> {
    exists(scope, Request::get(path(&format!("/containers/{id}/exists")))).await
}

/// Stream one container's resource-usage samples into `on_sample`.
pub async fn stream_container_stats(
    connection: &mut Connection,
    id: &str,
    on_sample: impl FnMut(Value) -> Result<()>,
) -> Result<()> {
    connection
        .monitor_records(
            Request::get(path("/containers/stats"))
                .param("containers", id)
                .param("stream", true),
            on_sample,
        )
        .await
}

/// Tail a container's log as raw bytes (the log is not line-JSON; terminal
/// escapes pass through untouched).
pub async fn container_logs(
    connection: &mut Connection,
    id: &str,
    on_chunk: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    connection
        .monitor_raw(
            Request::get(path(&format!("/containers/{id}/logs")))
                .param("follow", true)
                .param("stdout", true)
                .param("stderr", true),
            on_chunk,
        )
        .await
}

// ── Interactive terminals ────────────────────────────────────────────────

/// Upgrade request attaching to a container's main process.
pub fn attach_request(id: &str) -> Request {
    Request::post(path(&format!("/containers/{id}/attach")))
        .param("stream", true)
        .param("stdin", true)
        .param("stdout", true)
        .param("stderr", true)
}

/// Upgrade request starting a created exec session.
pub fn exec_start_request(exec_id: &str) -> Request {
    Request::post(path(&format!("/exec/{exec_id}/start"))).body(r#"{"Detach":false,"Tty":true}"#)
}

/// Attach an interactive tunnel to a container's main process.
pub async fn attach(
    scope: Scope,
    id: &str,
    on_output: impl FnMut(&[u8]) + Send + 'static,
    on_disconnect: impl FnOnce() + Send + 'static,
) -> Result<Tunnel> {
    Tunnel::open(scope, attach_request(id), on_output, on_disconnect).await
}

/// Create an exec session running `command` in a container with a TTY and
/// all stdio attached; answers the session id for [`exec_start`].
pub async fn exec_create(scope: Scope, id: &str, command: &[&str]) -> Result<String> {
    let body = json!({
        "AttachStdin": true,
        "AttachStdout": true,
        "AttachStderr": true,
        "Tty": true,
        "Cmd": command,
    });
    let value = connection::call_json(
        scope,
        Request::post(path(&format!("/containers/{id}/exec"))).json_body(&body),
    )
    .await?;
    value
        .get("Id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::protocol("exec create response carries no Id"))
}

/// Start a created exec session as an interactive tunnel.
pub async fn exec_start(
    scope: Scope,
    exec_id: &str,
    on_output: impl FnMut(&[u8]) + Send + 'static,
    on_disconnect: impl FnOnce() + Send + 'static,
) -> Result<Tunnel> {
    Tunnel::open(scope, exec_start_request(exec_id), on_output, on_disconnect).await
}

/// Resize the pseudo-terminal behind an attached container tunnel.
///
/// Issues the resize RPC *and* relays the redraw control byte through the
/// tunnel; both always happen, neither substitutes for the other.
pub async fn resize_container_terminal(
    scope: Scope,
    tunnel: &Tunnel,
    id: &str,
    height: u16,
    width: u16,
) -> Result<()> {
    connection::call(
        scope,
        Request::post(path(&format!("/containers/{id}/resize")))
            .param("h", height)
            .param("w", width),
    )
    .await?;
    tunnel.redraw().await
}

/// Resize the pseudo-terminal behind an exec-session tunnel; see
/// [`resize_container_terminal`].
pub async fn resize_exec_terminal(
    scope: Scope,
    tunnel: &Tunnel,
    exec_id: &str,
    height: u16,
    width: u16,
) -> Result<()> {
    connection::call(
        scope,
        Request::post(path(&format!("/exec/{exec_id}/resize")))
            .param("h", height)
            .param("w", width),
    )
    .await?;
    tunnel.redraw().await
}

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

pub async fn get_pods(scope: Scope) -> Result<Value> {
    connection::call_json(scope, Request::get(path("/pods/json"))).await
}

pub async fn create_pod(scope: Scope, spec: &Value) -> Result<Value> {
    connection::call_json(scope, Request::post(path("/pods/create")).json_body(spec)).await
}

/// Post one pod lifecycle action: `start`, `stop`, `restart`, `pause`,
/// `unpause`, or `kill`.
pub async fn post_pod(scope: Scope, id: &str, action: &str) -> Result<()> {
    connection::call(scope, Request::post(path(&format!("/pods/{id}/{action}")))).await?;
    Ok(())
}

pub async fn del_pod(scope: Scope, id: &str, force: bool) -> Result<()> {
    connection::call(scope, Request::delete(path(&format!("/pods/{id}"))).param("force", force))
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub async fn get_images(scope: Scope) -> Result<Value> {
    connection::call_json(scope, Request::get(path("/images/json"))).await
}

pub async fn del_image(scope: Scope, id: &str) -> Result<Value> {
    connection::call_json(scope, Request::delete(path(&format!("/images/{id}")))).await
}

pub async fn untag_image(scope: Scope, id: &str, repo: &str, tag: &str) -> Result<()> {
    connection::call(
        scope,
        Request::post(path(&format!("/images/{id}/untag")))
            .param("repo", repo)
            .param("tag", tag),
    )
    .await?;
    Ok(())
}

/// Pull an image by reference.
///
/// The engine answers HTTP 200 with one JSON progress record per line and
/// reports failure only in the **last** record's `error`/`cause` fields.
/// Earlier records are progress and are ignored here. Returns the final
/// record on success.
pub async fn pull_image(scope: Scope, reference: &str) -> Result<Value> {
    let response = connection::call(
        scope,
        Request::post(path("/images/pull")).param("reference", reference),
    )
    .await?;
    pull_outcome(&response)
}

/// Last-line success/failure policy for the pull response. The split skips
/// trailing empty segments, so a trailing newline cannot shift which line is
/// inspected.
fn pull_outcome(response: &str) -> Result<Value> {
    let last = response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .ok_or_else(|| Error::protocol("image pull produced no status records"))?;
    let value: Value = serde_json::from_str(last)?;
    if value.get("error").is_some() || value.get("cause").is_some() {
        let mut engine: EngineError = serde_json::from_value(value.clone())?;
        if engine.message.is_none() {
            engine.message = value.get("error").and_then(Value::as_str).map(str::to_string);
        }
        return Err(Error::engine(engine));
    }
    Ok(value)
}

pub async fn image_exists(scope: Scope, id: &str) -> Result<bool> {
    exists(scope, Request::get(path(&format!("/images/{id}/exists")))).await
}

pub async fn image_history(scope: Scope, id: &str) -> Result<Value> {
    connection::call_json(scope, Request::get(path(&format!("/images/{id}/history")))).await
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

pub async fn get_volumes(scope: Scope) -> Result<Value> {
    connection::call_json(scope, Request::get(path("/volumes/json"))).await
}

pub async fn create_volume(scope: Scope, spec: &Value) -> Result<Value> {
    connection::call_json(scope, Request::post(path("/volumes/create")).json_body(spec)).await
}

pub async fn del_volume(scope: Scope, name: &str, force: bool) -> Result<()> {
    connection::call(
        scope,
        Request::delete(path(&format!("/volumes/{name}"))).param("force", force),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_carries_api_version() {
        assert_eq!(path("/info"), "/v1.12/libpod/info");
        assert_eq!(
            path("/containers/web/json"),
            "/v1.12/libpod/containers/web/json"
        );
    }

    #[test]
    fn test_attach_request_target() {
        let request = attach_request("9f1a");
        assert_eq!(
            request.target(),
            "/v1.12/libpod/containers/9f1a/attach?stream=true&stdin=true&stdout=true&stderr=true"
        );
    }

    #[test]
    fn test_exec_start_request_body() {
        let bytes = exec_start_request("e7").encode_upgrade();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /v1.12/libpod/exec/e7/start HTTP/1.0\r\n"));
        assert!(text.contains("Upgrade: WebSocket\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"Detach\":false,\"Tty\":true}"));
    }

    #[test]
    fn test_pull_outcome_success_returns_last_record() {
        let response = "{\"stream\":\"pulling\"}\n{\"stream\":\"copying blob\"}\n{\"images\":[\"sha256:abc\"],\"id\":\"sha256:abc\"}\n";
        let value = pull_outcome(response).unwrap();
        assert_eq!(value["id"], "sha256:abc");
    }

    #[test]
    fn test_pull_outcome_error_in_last_record() {
        let response =
            "{\"stream\":\"pulling\"}\n{\"error\":\"manifest unknown\",\"cause\":\"not found\"}\n";
        let err = pull_outcome(response).unwrap_err();
        let Error::Engine(engine) = err else {
            panic!("expected engine error, got {err:?}");
        };
        assert_eq!(engine.message.as_deref(), Some("manifest unknown"));
        assert_eq!(engine.cause.as_deref(), Some("not found"));
    }

    #[test]
    fn test_pull_outcome_ignores_earlier_errors() {
        // Only the final record decides the outcome.
        let response = "{\"error\":\"transient\"}\n{\"images\":[\"sha256:abc\"]}\n";
        assert!(pull_outcome(response).is_ok());
    }

    #[test]
    fn test_pull_outcome_skips_trailing_blank_lines() {
        let response = "{\"images\":[\"sha256:abc\"]}\n\n  \n";
        let value = pull_outcome(response).unwrap();
        assert_eq!(value["images"][0], "sha256:abc");
    }

    #[test]
    fn test_pull_outcome_empty_response_is_protocol_error() {
        assert!(matches!(pull_outcome(""), Err(Error::Protocol { .. })));
        assert!(matches!(pull_outcome("\n \n"), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_info_timeout_is_five_seconds() {
        assert_eq!(INFO_TIMEOUT, Duration::from_millis(5000));
    }
}
