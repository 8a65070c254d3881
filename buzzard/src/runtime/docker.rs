//! Docker engine API client over the daemon's unix socket.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Deserialize;
use tracing::debug;

use crate::runtime::{EventSource, ProcessInspector, RuntimeEvent};
use crate::{Error, Result};

type HyperClient = Client<UnixConnector, Empty<Bytes>>;

/// `filters={"type":["container"]}`, url encoded.
const EVENTS_ENDPOINT: &str = "/events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D";

#[derive(Clone)]
pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    async fn get(&self, endpoint: &str) -> Result<Response<Incoming>> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())?;
        Ok(self.client.request(req).await?)
    }

    /// Opens the event stream, filtered to container events.
    pub async fn subscribe(&self) -> Result<DockerEvents> {
        let res = self.get(EVENTS_ENDPOINT).await?;
        let res = ensure_success(EVENTS_ENDPOINT, res).await?;
        Ok(DockerEvents {
            body: res.into_body(),
            buffer: BytesMut::new(),
        })
    }

    pub async fn inspect_pid(&self, container_id: &str) -> Result<Option<u32>> {
        if !is_valid_container_ref(container_id) {
            return Err(Error::DockerApi(format!(
                "invalid container reference {container_id:?}"
            )));
        }
        let endpoint = format!("/containers/{container_id}/json");
        let res = self.get(&endpoint).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = ensure_success(&endpoint, res).await?;
        let body = res.into_body().collect().await?.to_bytes();
        parse_inspect_pid(&body)
    }
}

impl ProcessInspector for DockerClient {
    async fn pid_for(&self, container_id: &str) -> Result<Option<u32>> {
        self.inspect_pid(container_id).await
    }
}

/// Streaming body of `GET /events`; one JSON document per line.
pub struct DockerEvents {
    body: Incoming,
    buffer: BytesMut,
}

impl EventSource for DockerEvents {
    async fn next_event(&mut self) -> Result<RuntimeEvent> {
        loop {
            while let Some(line) = take_line(&mut self.buffer) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return parse_event(&line);
            }
            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::EventStreamClosed),
            }
        }
    }
}

async fn ensure_success(endpoint: &str, res: Response<Incoming>) -> Result<Response<Incoming>> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.into_body().collect().await?.to_bytes();
    Err(Error::DockerApi(format!(
        "{endpoint} returned {status}: {}",
        String::from_utf8_lossy(&body).trim()
    )))
}

fn is_valid_container_ref(container_id: &str) -> bool {
    !container_id.is_empty()
        && container_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn take_line(buffer: &mut BytesMut) -> Option<Bytes> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    Some(line.freeze())
}

#[derive(Debug, Default, Deserialize)]
struct EventMessage {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
    #[serde(default)]
    time: i64,
    #[serde(rename = "timeNano", default)]
    time_nano: i64,
}

#[derive(Debug, Default, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

fn parse_event(line: &[u8]) -> Result<RuntimeEvent> {
    let mut msg: EventMessage = serde_json::from_slice(line)?;
    debug!(kind = %msg.kind, action = %msg.action, "received runtime event");
    Ok(RuntimeEvent {
        container_name: msg.actor.attributes.remove("name").unwrap_or_default(),
        image: msg.actor.attributes.remove("image").unwrap_or_default(),
        category: msg.kind,
        action: msg.action,
        container_id: msg.actor.id,
        time: msg.time,
        time_nano: msg.time_nano,
    })
}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerInspectState,
}

#[derive(Debug, Deserialize)]
struct ContainerInspectState {
    #[serde(rename = "Pid", default)]
    pid: u32,
}

fn parse_inspect_pid(body: &[u8]) -> Result<Option<u32>> {
    let inspect: ContainerInspect = serde_json::from_slice(body)?;
    match inspect.state.pid {
        0 => Ok(None),
        pid => Ok(Some(pid)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const START_EVENT: &str = r#"{"status":"start","id":"4f1b","from":"nginx:latest","Type":"container","Action":"start","Actor":{"ID":"4f1b","Attributes":{"image":"nginx:latest","name":"web"}},"scope":"local","time":1700000000,"timeNano":1700000000123456789}"#;

    #[test]
    fn test_parse_event() -> Result<()> {
        let event = parse_event(START_EVENT.as_bytes())?;
        assert_eq!(
            event,
            RuntimeEvent {
                category: "container".into(),
                action: "start".into(),
                container_id: "4f1b".into(),
                container_name: "web".into(),
                image: "nginx:latest".into(),
                time: 1700000000,
                time_nano: 1700000000123456789,
            }
        );
        Ok(())
    }

    #[test]
    fn test_take_line_splits_partial_frames() {
        let mut buffer = BytesMut::from("{\"a\":1}\n{\"b\"");
        assert_eq!(take_line(&mut buffer).as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(take_line(&mut buffer), None);

        buffer.extend_from_slice(b":2}\n");
        assert_eq!(take_line(&mut buffer).as_deref(), Some(&b"{\"b\":2}"[..]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_inspect_pid() -> Result<()> {
        let running = br#"{"Id":"4f1b","State":{"Status":"running","Running":true,"Pid":4242}}"#;
        assert_eq!(parse_inspect_pid(running)?, Some(4242));

        let exited = br#"{"Id":"4f1b","State":{"Status":"exited","Running":false,"Pid":0}}"#;
        assert_eq!(parse_inspect_pid(exited)?, None);
        Ok(())
    }

    #[test]
    fn test_container_ref_validation() {
        assert!(is_valid_container_ref("4f1b2c"));
        assert!(is_valid_container_ref("my_web-1.0"));
        assert!(!is_valid_container_ref(""));
        assert!(!is_valid_container_ref("../../info"));
    }
}
