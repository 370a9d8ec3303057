//! Read-only monitoring view over the Roost relational store.
//!
//! Serves the non-removed instances as an HTML table at `/` and as JSON at
//! `/api/instances`, plus a `/health` probe. The database is opened with
//! [`SqliteStore::open_read_only`], so nothing reachable from a request can
//! write a record.
//!
//! The [`TestServer`] helper starts a monitor on a random port for integration testing.

use chrono::{DateTime, Utc};
use roost_schema::Instance;
use roost_store::{InstanceFilter, InstanceStore, SqliteStore, StoreError};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error};

/// Errors from binding or serving; tiny_http reports these boxed.
pub type ServeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One row of the fleet view.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceView {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Instance> for InstanceView {
    fn from(inst: &Instance) -> Self {
        Self {
            id: inst.id.to_string(),
            owner: inst.owner.to_string(),
            name: inst.name.clone(),
            status: inst.status.as_str().to_owned(),
            image: inst.resource_spec.image.clone(),
            created_at: inst.created_at,
            expires_at: inst.expires_at,
        }
    }
}

/// The store handle shared by every request.
pub struct Monitor {
    store: SqliteStore,
}

impl Monitor {
    pub fn open(db: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(Self {
            store: SqliteStore::open_read_only(db)?,
        })
    }

    pub fn db_path(&self) -> &Path {
        self.store.path()
    }

    /// Every instance that has not been removed, oldest first.
    pub fn instances(&self) -> Result<Vec<InstanceView>, StoreError> {
        Ok(self
            .store
            .list(&InstanceFilter::active())?
            .iter()
            .map(InstanceView::from)
            .collect())
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn format_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at.map_or_else(
        || "never".to_owned(),
        |at| at.format("%Y-%m-%d %H:%M UTC").to_string(),
    )
}

/// Render the fleet table.
pub fn render_html(rows: &[InstanceView]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Roost instances</title></head>\n\
         <body>\n<h1>Roost instances</h1>\n",
    );
    if rows.is_empty() {
        html.push_str("<p>No active instances.</p>\n");
    } else {
        html.push_str(
            "<table>\n<tr><th>Owner</th><th>Name</th><th>Status</th><th>Expires</th></tr>\n",
        );
        for row in rows {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td><td class=\"{status}\">{status}</td><td>{}</td></tr>",
                escape_html(&row.owner),
                escape_html(&row.name),
                format_expiry(row.expires_at),
                status = escape_html(&row.status),
            );
        }
        html.push_str("</table>\n");
    }
    html.push_str("</body></html>\n");
    html
}

fn content_type(value: &str) -> Option<Header> {
    Header::from_bytes("Content-Type", value).ok()
}

fn respond_with(req: tiny_http::Request, body: String, code: u16, mime: &str) {
    let mut response = Response::from_string(body).with_status_code(StatusCode(code));
    if let Some(header) = content_type(mime) {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    respond_with(req, msg.to_owned(), code, "text/plain; charset=utf-8");
}

fn store_failure(req: tiny_http::Request, url: &str, e: &StoreError) {
    error!("GET {url}: {e}");
    respond_err(req, 500, "store unavailable");
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(monitor: &Monitor, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    if method != Method::Get {
        respond_err(req, 405, "method not allowed");
        return;
    }

    let path = url.split('?').next().unwrap_or_default();
    match path {
        "/" => match monitor.instances() {
            Ok(rows) => respond_with(req, render_html(&rows), 200, "text/html; charset=utf-8"),
            Err(e) => store_failure(req, &url, &e),
        },
        "/api/instances" => match monitor.instances() {
            Ok(rows) => {
                let json = serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_owned());
                respond_with(req, json, 200, "application/json");
            }
            Err(e) => store_failure(req, &url, &e),
        },
        "/health" => respond_with(req, r#"{"status":"ok"}"#.to_owned(), 200, "application/json"),
        _ => respond_err(req, 404, "not found"),
    }
}

/// Bind `addr` and serve requests, blocking the current thread.
pub fn run_server(monitor: &Monitor, addr: &str) -> Result<(), ServeError> {
    let server = Server::http(addr)?;
    for request in server.incoming_requests() {
        handle_request(monitor, request);
    }
    Ok(())
}

/// A test helper that starts a monitor on a random port in a background thread.
///
/// Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Serve the database at `db` on `127.0.0.1:0`.
    pub fn start(db: impl Into<PathBuf>) -> Result<Self, ServeError> {
        let monitor = Monitor::open(db)?;
        let server = Arc::new(Server::http("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .ok_or("monitor bound to a non-IP address")?
            .port();
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&monitor, request);
            }
        });

        Ok(Self {
            url,
            port,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
