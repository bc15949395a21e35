//! HTTP client for scripts.
//!
//! - `http.request{url=, method=, headers=, body=}`: perform a request
//! - `http.get(url [, headers])`: shorthand for a GET request
//!
//! Both return `{status=, body=, headers=}`. Transport failures and invalid
//! requests return `{status=0, err=message}` instead of raising.
//!
//! In async mode a request made inside a coroutine yields `"http"` and the
//! request table to the host, which performs the request and resumes the
//! coroutine with the response table.

use std::time::Duration;

use luau_bridge::{Frame, Outcome, Result, StackOps, TableOps, Type};
use tracing::debug;

use crate::{Export, Library};

/// Per-request timeout.
pub const TIMEOUT: Duration = Duration::from_secs(30);

/// First value of the yield an async request suspends with.
pub const YIELD_TAG: &str = "http";

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct HttpLibrary {
    async_yield: bool,
}

impl Default for HttpLibrary {
    fn default() -> Self {
        Self::new(false)
    }
}

impl HttpLibrary {
    pub fn new(async_yield: bool) -> Self {
        Self { async_yield }
    }
}

impl Library for HttpLibrary {
    fn name(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "HTTP requests with a blocking or host-driven client"
    }

    fn exports(&self) -> Vec<Export> {
        let request = self.async_yield;
        let get = self.async_yield;
        vec![
            Export::new("request", move |frame: &Frame| http_request(frame, request)),
            Export::new("get", move |frame: &Frame| http_get(frame, get)),
        ]
    }
}

fn http_request(frame: &Frame, async_yield: bool) -> Result<Outcome> {
    match read_request(frame, 1) {
        Ok(_) if async_yield && frame.is_yieldable() => {
            frame.set_top(1);
            frame.push_string(YIELD_TAG);
            frame.insert(1);
            frame.yield_values(2)
        }
        Ok(request) => respond(frame, &execute(&request)),
        Err(message) => respond(frame, &HttpResponse::failed(message)),
    }
}

fn http_get(frame: &Frame, async_yield: bool) -> Result<Outcome> {
    let url = if frame.type_of(1) == Type::String { frame.to_string(1) } else { None };
    let Some(url) = url else {
        return respond(frame, &HttpResponse::failed("url is required"));
    };
    // Rebuild the call as a request table so both entry points share one path.
    let headers = frame.is_table(2);
    frame.create_table(0, 2);
    frame.push_string(&url);
    frame.set_field(-2, "url")?;
    if headers {
        frame.push_value(2);
        frame.set_field(-2, "headers")?;
    }
    frame.insert(1);
    frame.set_top(1);
    http_request(frame, async_yield)
}

fn respond(frame: &Frame, response: &HttpResponse) -> Result<Outcome> {
    push_response(frame, response)?;
    Ok(Outcome::returns(1))
}

/// Read the request table at `idx`. The error is the message a script sees
/// in the `err` field.
pub fn read_request<S: StackOps + ?Sized>(s: &S, idx: i32) -> std::result::Result<HttpRequest, String> {
    if !s.is_table(idx) {
        return Err("request must be a table".to_string());
    }
    let t = s.abs_index(idx);

    let url = string_field(s, t, "url")?.unwrap_or_default();
    if url.is_empty() {
        return Err("url is required".to_string());
    }
    let method = string_field(s, t, "method")?
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| "GET".to_string());
    if !METHODS.contains(&method.as_str()) {
        return Err(format!("unsupported HTTP method: {}", method));
    }

    let body = match s.get_field(t, "body").map_err(|e| e.message().to_string())? {
        Type::Nil => None,
        _ => s.to_bytes(-1),
    };
    s.pop(1);

    let mut headers = Vec::new();
    if s.get_field(t, "headers").map_err(|e| e.message().to_string())? == Type::Table {
        s.push_nil();
        while s.next(-2) {
            // Numeric keys must not be converted in place during traversal.
            if s.type_of(-2) == Type::String {
                if let (Some(name), Some(value)) = (s.to_string(-2), s.to_string(-1)) {
                    headers.push((name, value));
                }
            }
            s.pop(1);
        }
        headers.sort();
    }
    s.pop(1);

    Ok(HttpRequest {
        url,
        method,
        headers,
        body,
    })
}

fn string_field<S: StackOps + ?Sized>(s: &S, t: i32, key: &str) -> std::result::Result<Option<String>, String> {
    let ty = s.get_field(t, key).map_err(|e| e.message().to_string())?;
    let value = match ty {
        Type::String | Type::Number => s.to_string(-1),
        _ => None,
    };
    s.pop(1);
    Ok(value)
}

/// Push the response table a script receives.
pub fn push_response<S: StackOps + ?Sized>(s: &S, response: &HttpResponse) -> Result<()> {
    s.create_table(0, 3);
    if let Some(err) = &response.error {
        s.push_number(0.0);
        s.set_field(-2, "status")?;
        s.push_string(err);
        s.set_field(-2, "err")?;
        return Ok(());
    }
    s.push_number(f64::from(response.status));
    s.set_field(-2, "status")?;
    s.push_bytes(&response.body);
    s.set_field(-2, "body")?;
    s.create_table(0, response.headers.len().try_into().unwrap_or(0));
    for (name, value) in &response.headers {
        s.push_string(value);
        s.set_field(-2, name)?;
    }
    s.set_field(-2, "headers")
}

/// Perform a request with the blocking client. The client runs on its own
/// thread so this is safe to call from inside an async runtime.
pub fn execute(request: &HttpRequest) -> HttpResponse {
    std::thread::scope(|scope| {
        scope
            .spawn(|| send(request))
            .join()
            .unwrap_or_else(|_| HttpResponse::failed("request failed: client thread panicked"))
    })
}

fn send(request: &HttpRequest) -> HttpResponse {
    let client = match reqwest::blocking::Client::builder().timeout(TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => return HttpResponse::failed(format!("failed to create client: {}", e)),
    };
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return HttpResponse::failed(format!("unsupported HTTP method: {}", request.method)),
    };

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = match builder.send() {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return HttpResponse::failed(format!("request timed out after {} seconds", TIMEOUT.as_secs()));
        }
        Err(e) => return HttpResponse::failed(format!("request failed: {}", e)),
    };

    let status = response.status().as_u16();
    let mut headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
    headers.sort();
    let body = match response.bytes() {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return HttpResponse::failed(format!("failed to read response body: {}", e)),
    };
    debug!(method = %request.method, url = %request.url, status, "http request finished");

    HttpResponse {
        status,
        headers,
        body,
        error: None,
    }
}
