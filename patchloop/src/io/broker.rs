//! Text generation backends.
//!
//! The pipeline depends only on [`TextGenerator`]. [`OllamaBroker`] talks to an
//! Ollama-compatible `/api/generate` endpoint; tests use the scripted broker in
//! `test_support`.

use std::io::{BufRead, BufReader, Lines};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Lazily produced response chunks.
pub type TokenStream<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// One prompt for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
}

impl GenerateRequest {
    pub fn new(model: &str, system: &str, prompt: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            system: system.to_string(),
            prompt: prompt.into(),
        }
    }
}

/// Prompt/response access to a model-serving backend.
pub trait TextGenerator {
    /// Full response text in one call.
    fn generate(&self, request: &GenerateRequest) -> Result<String>;

    /// Response text as it is produced.
    fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream<'_>>;
}

impl<T: TextGenerator + ?Sized> TextGenerator for &T {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        (**self).generate(request)
    }

    fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream<'_>> {
        (**self).generate_stream(request)
    }
}

impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        (**self).generate(request)
    }

    fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream<'_>> {
        (**self).generate_stream(request)
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerate<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Blocking client for `POST {base_url}/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaBroker {
    client: Client,
    base_url: String,
}

impl OllamaBroker {
    /// No request timeout unless `timeout` is given; long generations are
    /// bounded by the endpoint.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let client = Client::builder()
            .tcp_nodelay(true)
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn post(&self, request: &GenerateRequest, stream: bool) -> Result<Response> {
        let url = self.endpoint();
        let body = OllamaGenerate {
            model: &request.model,
            prompt: &request.prompt,
            system: &request.system,
            stream,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            bail!(
                "Model '{m}' not available at {base}; pull it first (e.g. `ollama pull {m}`)",
                m = request.model,
                base = self.base_url
            );
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("generate request to {url} failed with {status}: {}", text.trim());
        }
        Ok(response)
    }
}

impl TextGenerator for OllamaBroker {
    #[instrument(skip_all, fields(model = %request.model))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let response = self.post(request, false)?;
        let chunk: OllamaChunk = response.json().context("decode generate response")?;
        debug!(chars = chunk.response.len(), "generation finished");
        Ok(chunk.response)
    }

    #[instrument(skip_all, fields(model = %request.model))]
    fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream<'_>> {
        let response = self.post(request, true)?;
        Ok(Box::new(NdjsonChunks {
            lines: BufReader::new(response).lines(),
            done: false,
        }))
    }
}

/// Iterator over the `response` fields of a streamed NDJSON body.
struct NdjsonChunks {
    lines: Lines<BufReader<Response>>,
    done: bool,
}

impl Iterator for NdjsonChunks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    self.done = true;
                    return Some(Err(anyhow!(err).context("read generate stream")));
                }
            };
            match parse_stream_line(&line) {
                Some(chunk) => {
                    self.done = chunk.done;
                    if !chunk.response.is_empty() {
                        return Some(Ok(chunk.response));
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(line = %line, "skipping malformed stream line"),
            }
        }
        None
    }
}

fn parse_stream_line(line: &str) -> Option<OllamaChunk> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::*;

    /// Serve one HTTP response and hand back the raw request.
    fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept");
            let request = read_request(&mut socket);
            socket.write_all(response.as_bytes()).expect("respond");
            request
        });
        (url, handle)
    }

    fn read_request(socket: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).expect("read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new("coder-model", "be terse", "fix it")
    }

    #[test]
    fn generate_posts_prompt_and_reads_response() {
        let (url, server) = serve_once("200 OK", r#"{"response":"done!","done":true}"#);
        let broker = OllamaBroker::new(&url, None).expect("broker");
        let text = broker.generate(&request()).expect("generate");
        assert_eq!(text, "done!");

        let raw = server.join().expect("server");
        assert!(raw.starts_with("POST /api/generate "));
        assert!(raw.contains(r#""model":"coder-model""#));
        assert!(raw.contains(r#""system":"be terse""#));
        assert!(raw.contains(r#""stream":false"#));
    }

    #[test]
    fn stream_yields_non_empty_chunks_until_done() {
        let body = concat!(
            "{\"response\":\"--- a\",\"done\":false}\n",
            "not json\n",
            "{\"response\":\"\",\"done\":false}\n",
            "{\"response\":\"/x\",\"done\":true}\n",
            "{\"response\":\"ignored\",\"done\":false}\n",
        );
        let (url, server) = serve_once("200 OK", body);
        let broker = OllamaBroker::new(&url, Some(Duration::from_secs(10))).expect("broker");
        let chunks: Vec<String> = broker
            .generate_stream(&request())
            .expect("stream")
            .collect::<Result<_>>()
            .expect("chunks");
        assert_eq!(chunks, vec!["--- a".to_string(), "/x".to_string()]);
        let raw = server.join().expect("server");
        assert!(raw.contains(r#""stream":true"#));
    }

    #[test]
    fn missing_model_is_reported() {
        let (url, server) = serve_once("404 Not Found", r#"{"error":"model not found"}"#);
        let broker = OllamaBroker::new(&url, None).expect("broker");
        let err = broker.generate(&request()).unwrap_err();
        assert!(err.to_string().contains("Model 'coder-model' not available"));
        assert!(err.to_string().contains("ollama pull coder-model"));
        server.join().expect("server");
    }

    #[test]
    fn server_error_includes_body() {
        let (url, server) = serve_once("500 Internal Server Error", "out of memory");
        let broker = OllamaBroker::new(&url, None).expect("broker");
        let err = broker.generate_stream(&request()).err().expect("error");
        assert!(err.to_string().contains("out of memory"));
        server.join().expect("server");
    }
}
