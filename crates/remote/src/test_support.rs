//! Scripted HTTP server for client tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// What the server does with the next accepted request.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Close the socket without answering.
    DropConnection,
    Respond { status: u16, body: String },
}

impl MockOutcome {
    pub fn json(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            body: body.to_string(),
        }
    }
}

pub fn api_error_body(code: &str, message: &str) -> String {
    serde_json::json!({ "error": "error", "code": code, "message": message }).to_string()
}

type Captured = Arc<Mutex<Vec<CapturedRequest>>>;

/// Splits a raw request at the blank line. Returns `(head, body_start)`.
fn split_head(raw: &[u8]) -> Option<(String, usize)> {
    let end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    Some((String::from_utf8_lossy(&raw[..end]).into_owned(), end + 4))
}

async fn read_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
    let mut raw = Vec::with_capacity(4096);
    let mut chunk = vec![0_u8; 4096];

    let (head, body_start) = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&chunk[..n]);
        if let Some(split) = split_head(&raw) {
            break split;
        }
    };

    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let expected = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while raw.len() - body_start < expected {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&raw[body_start..]).into_owned(),
    })
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} Mock\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await
}

async fn serve_one(mut stream: TcpStream, captured: Captured, script: Arc<Mutex<VecDeque<MockOutcome>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    captured.lock().await.push(request);
    let next = script.lock().await.pop_front();
    match next {
        Some(MockOutcome::DropConnection) => {}
        Some(MockOutcome::Respond { status, body }) => {
            let _ = respond(&mut stream, status, &body).await;
        }
        None => {
            let body = api_error_body("UNSCRIPTED", "no response scripted");
            let _ = respond(&mut stream, 500, &body).await;
        }
    }
}

/// Answers requests with `outcomes` in arrival order. Requests beyond the
/// script get a 500.
pub async fn start_mock_server(
    outcomes: Vec<MockOutcome>,
) -> (String, Captured, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let captured: Captured = Arc::default();
    let script = Arc::new(Mutex::new(VecDeque::from(outcomes)));

    let requests = Arc::clone(&captured);
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_one(stream, Arc::clone(&requests), Arc::clone(&script)));
        }
    });
    (url, captured, handle)
}
