//! Minimal HTTP responder for transport tests.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub(crate) struct TestServer {
  pub base_url: String,
  requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
  /// Request targets (path and query) in arrival order.
  pub fn requests(&self) -> Vec<String> {
    self.requests.lock().unwrap().clone()
  }
}

/// Serve `respond(target) -> (status, body)` on an ephemeral local port.
pub(crate) async fn serve<F>(respond: F) -> TestServer
where
  F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let requests = Arc::new(Mutex::new(Vec::new()));
  let seen = Arc::clone(&requests);
  let respond = Arc::new(respond);

  tokio::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      let respond = Arc::clone(&respond);
      let seen = Arc::clone(&seen);
      tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
          let n = socket.read(&mut chunk).await.unwrap_or(0);
          if n == 0 {
            break;
          }
          buf.extend_from_slice(&chunk[..n]);
          if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
          }
        }

        let request = String::from_utf8_lossy(&buf);
        let target = request.split_whitespace().nth(1).unwrap_or("/").to_string();
        seen.lock().unwrap().push(target.clone());

        let (status, body) = respond(&target);
        let response = format!(
          "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          status,
          body.len(),
          body
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
      });
    }
  });

  TestServer {
    base_url: format!("http://{}", addr),
    requests,
  }
}
