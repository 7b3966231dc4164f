#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use homearc::zip::ZipWriter;

/// Build a container holding `manifest` as `Home.xml` followed by `entries`
pub fn home_zip(manifest: &str, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(6);
    zip.add_entry("Home.xml", manifest.as_bytes()).unwrap();
    for (name, data) in entries {
        zip.add_entry(name, data).unwrap();
    }
    zip.finish().unwrap()
}

/// Observer events, in arrival order
#[derive(Default)]
pub struct Events(Mutex<Vec<String>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    /// Push unless `event` repeats the previous one
    pub fn push_distinct(&self, event: impl Into<String>) {
        let event = event.into();
        let mut events = self.0.lock().unwrap();
        if events.last() != Some(&event) {
            events.push(event);
        }
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Serve `routes` (path to body) over plain HTTP on a loopback port.
/// HEAD and `Range: bytes=a-b` requests are honoured. Returns the base URL.
pub async fn serve(routes: Vec<(&str, Vec<u8>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes: Arc<HashMap<String, Vec<u8>>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, body)| (path.to_string(), body))
            .collect(),
    );

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(respond(socket, routes.clone()));
        }
    });
    format!("http://{addr}")
}

async fn respond(mut socket: TcpStream, routes: Arc<HashMap<String, Vec<u8>>>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let head = String::from_utf8_lossy(&request).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let range = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });

    let response = match routes.get(&path) {
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        Some(body) => {
            let (status, slice, content_range) =
                match range.as_deref().and_then(|r| parse_range(r, body.len())) {
                    Some((start, end)) => (
                        "206 Partial Content",
                        &body[start..=end],
                        format!("Content-Range: bytes {start}-{end}/{}\r\n", body.len()),
                    ),
                    None => ("200 OK", &body[..], String::new()),
                };
            let mut out = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n{content_range}Connection: close\r\n\r\n",
                slice.len()
            )
            .into_bytes();
            if method != "HEAD" {
                out.extend_from_slice(slice);
            }
            out
        }
    };
    let _ = socket.write_all(&response).await;
    let _ = socket.shutdown().await;
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse::<usize>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}
