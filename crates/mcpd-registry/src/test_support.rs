//! Scripted MCP server for lifecycle tests.
//!
//! Listens on a loopback port and answers JSON-RPC over plain HTTP, so
//! tests can drive a real connect/initialize/refresh cycle without a
//! subprocess. Every incoming method is recorded for call-count
//! assertions.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) struct ScriptedServer {
    pub url: String,
    calls: Arc<std::sync::Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();

        let recorded = Arc::clone(&calls);
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut socket).await else {
                        return;
                    };
                    let method = request["method"].as_str().unwrap_or_default().to_string();
                    recorded.lock().unwrap().push(method.clone());

                    let body = match request.get("id") {
                        // Notifications get an empty acknowledgement.
                        None => json!({}),
                        Some(id) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": respond_to(&method),
                        }),
                    };
                    let payload = body.to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                        payload.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            url: format!("http://{addr}/mcp"),
            calls,
            task,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond_to(method: &str) -> Value {
    match method {
        "initialize" => json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": { "name": "scripted", "version": "0.0.1" },
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": true }
            }
        }),
        "tools/list" => json!({
            "tools": [
                { "name": "get_time", "description": "Current time" }
            ]
        }),
        "resources/list" => json!({
            "resources": [
                { "uri": "file:///demo.txt", "name": "demo", "mimeType": "text/plain" }
            ]
        }),
        "resources/read" => json!({
            "contents": [
                { "uri": "file:///demo.txt", "mimeType": "text/plain", "text": "hello world" }
            ]
        }),
        _ => json!({}),
    }
}

async fn read_http_request(socket: &mut TcpStream) -> Option<Value> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())?;
    while buffer.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    serde_json::from_slice(&buffer[header_end..header_end + length]).ok()
}
