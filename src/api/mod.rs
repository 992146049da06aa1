//! HTTP surface.
//!
//! - `POST /api/upload/` multipart (`file` field) or raw image body
//! - `GET /api/detections` filtered, paginated listing
//! - `DELETE /api/detections/{id}`
//! - `GET /api/images/{path}` and `GET /uploads/{path}` stored image bytes
//! - `GET /health`

mod http;

use anyhow::{anyhow, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ApiSettings;
use crate::error::Error;
use crate::images::content_type_for;
use crate::query::DetectionQuery;
use crate::service::DetectionService;

use self::http::{
    decode_path, read_file_field, read_request, read_timeout, write_response, HttpRequest,
    HttpResponse,
};

/// How long `stop` waits for in-flight requests to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops accepting, then waits for in-flight requests to finish.
    pub fn stop(self) -> Result<()> {
        self.stop_within(DRAIN_TIMEOUT)
    }

    pub fn stop_within(mut self, drain: Duration) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        let deadline = Instant::now() + drain;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "{} connection(s) still active after {:?}",
                    self.active_connections(),
                    drain
                ));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiSettings,
    service: Arc<DetectionService>,
}

impl ApiServer {
    pub fn new(cfg: ApiSettings, service: Arc<DetectionService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let shutdown_thread = shutdown.clone();
        let active_thread = active.clone();
        let join = std::thread::spawn(move || {
            let outcome = run_api(
                listener,
                self.cfg,
                self.service,
                shutdown_thread,
                active_thread,
            );
            if let Err(err) = outcome {
                log::error!("api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            active,
            join: Some(join),
        })
    }
}

/// Holds one of the `max_connections` slots until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot(active.clone());
        (previous < max).then_some(slot)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiSettings,
    service: Arc<DetectionService>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("dropping connection: {}", err);
                    continue;
                }
                let Some(slot) = ConnectionSlot::acquire(&active, cfg.max_connections) else {
                    let busy = HttpResponse::error(503, "server busy");
                    if let Err(err) = write_response(&mut stream, &busy) {
                        log::warn!("failed to reject connection: {}", err);
                    }
                    continue;
                };
                let service = service.clone();
                let max_body = cfg.max_upload_bytes;
                std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &service, max_body) {
                        log::warn!("api connection failed: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    service: &DetectionService,
    max_body: usize,
) -> Result<()> {
    stream.set_read_timeout(Some(read_timeout()))?;
    let response = match read_request(&mut stream, max_body) {
        Ok(request) => route(&request, service),
        Err(rejection) => rejection.into(),
    };
    write_response(&mut stream, &response)
}

fn route(request: &HttpRequest, service: &DetectionService) -> HttpResponse {
    let method = request.method.as_str();
    let path = request.path.as_str();
    if method == "OPTIONS" {
        return HttpResponse::no_content();
    }

    if path == "/health" {
        return match method {
            "GET" => HttpResponse::json(200, &serde_json::json!({ "status": "ok" })),
            _ => method_not_allowed(),
        };
    }
    if path == "/api/upload" || path == "/api/upload/" {
        return match method {
            "POST" => respond(upload(request, service), |record| {
                HttpResponse::json(201, &record)
            }),
            _ => method_not_allowed(),
        };
    }
    if path == "/api/detections" || path == "/api/detections/" {
        return match method {
            "GET" => respond(
                DetectionQuery::from_pairs(request.query_pairs())
                    .and_then(|query| service.list(&query)),
                |page| HttpResponse::json(200, &page),
            ),
            _ => method_not_allowed(),
        };
    }
    if let Some(raw_id) = path.strip_prefix("/api/detections/") {
        return match method {
            "DELETE" => respond(
                parse_id(raw_id).and_then(|id| service.delete(id)),
                |()| {
                    HttpResponse::json(
                        200,
                        &serde_json::json!({ "message": "Detection deleted successfully" }),
                    )
                },
            ),
            _ => method_not_allowed(),
        };
    }
    let image_path = path
        .strip_prefix("/api/images/")
        .or_else(|| path.strip_prefix("/uploads/"));
    if let Some(raw) = image_path {
        return match method {
            "GET" => {
                let name = decode_path(raw);
                respond(service.image(&name), |bytes| {
                    HttpResponse::bytes(content_type_for(&name), bytes)
                })
            }
            _ => method_not_allowed(),
        };
    }

    HttpResponse::error(404, "not found")
}

fn upload(
    request: &HttpRequest,
    service: &DetectionService,
) -> crate::error::Result<crate::record::DetectionRecord> {
    let content_type = request.header("content-type").unwrap_or("");
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return service.upload(&request.body, content_type);
    }

    let part = read_file_field(request.body.clone(), content_type)
        .map_err(|e| Error::InvalidInput(format!("malformed multipart body: {}", e)))?
        .ok_or_else(|| Error::InvalidInput("missing 'file' field".to_string()))?;
    log::debug!(
        "upload part {:?}, {} bytes",
        part.file_name.as_deref().unwrap_or("<unnamed>"),
        part.data.len()
    );
    service.upload(&part.data, &part.content_type)
}

fn parse_id(raw: &str) -> crate::error::Result<i64> {
    raw.trim_end_matches('/')
        .parse()
        .map_err(|_| Error::InvalidQuery(format!("invalid detection id '{}'", raw)))
}

fn respond<T>(
    outcome: crate::error::Result<T>,
    ok: impl FnOnce(T) -> HttpResponse,
) -> HttpResponse {
    match outcome {
        Ok(value) => ok(value),
        Err(err) => {
            if err.is_server_error() {
                log::error!("request failed: {}", err);
            } else {
                log::debug!("request rejected: {}", err);
            }
            HttpResponse::error(err.status_code(), &err.client_message())
        }
    }
}

fn method_not_allowed() -> HttpResponse {
    HttpResponse::error(405, "method not allowed")
}
