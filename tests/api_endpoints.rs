use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use headcount::api::{ApiHandle, ApiServer};
use headcount::config::ApiSettings;
use headcount::storage::shared;
use headcount::{
    Detection, DetectionQuery, DetectionService, DetectionStore, ImageStore, PersonDetector,
    SqliteDetectionStore, StubBackend,
};

const BOUNDARY: &str = "----headcount-test-boundary";

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(backend: StubBackend) -> Result<Self> {
        Self::with_settings(backend, ApiSettings::default())
    }

    fn with_settings(backend: StubBackend, settings: ApiSettings) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("headcount.db");
        let store = SqliteDetectionStore::open(&db_path.to_string_lossy())?;
        let service = DetectionService::new(
            Arc::new(ImageStore::new(dir.path().join("uploads"))),
            Arc::new(PersonDetector::new(backend)),
            shared(store),
        );
        let api_settings = ApiSettings {
            addr: "127.0.0.1:0".to_string(),
            ..settings
        };
        let api_handle = ApiServer::new(api_settings, Arc::new(service)).spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn uploads(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    fn send(&self, head: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        send_to(self.handle().addr, head, body)
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.send(
            &format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path),
            b"",
        )
    }

    fn delete(&self, path: &str) -> Result<(String, Vec<u8>)> {
        self.send(
            &format!("DELETE {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path),
            b"",
        )
    }

    fn upload(&self, bytes: &[u8], part_type: &str) -> Result<(String, Vec<u8>)> {
        let (head, body) = upload_request(bytes, part_type);
        self.send(&head, &body)
    }
}

fn send_to(addr: SocketAddr, head: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

fn upload_request(bytes: &[u8], part_type: &str) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"crowd.png\"\r\nContent-Type: {t}\r\n\r\n",
            b = BOUNDARY,
            t = part_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    let head = format!(
        "POST /api/upload/ HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        body.len()
    );
    (head, body)
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn png_bytes() -> Vec<u8> {
    let mut buf = Vec::new();
    RgbImage::from_pixel(64, 48, Rgb([90, 120, 150]))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png");
    buf
}

fn three_people() -> StubBackend {
    StubBackend::with_detections(vec![
        Detection::new([2.0, 2.0, 18.0, 40.0], 0.9, 0),
        Detection::new([20.0, 2.0, 36.0, 40.0], 0.8, 0),
        Detection::new([38.0, 2.0, 54.0, 40.0], 0.7, 0),
        Detection::new([0.0, 0.0, 60.0, 20.0], 0.95, 2),
    ])
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("json body")
}

fn upload_file_count(api: &TestApi) -> usize {
    std::fs::read_dir(api.uploads())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
fn upload_counts_people_and_returns_record() -> Result<()> {
    let api = TestApi::new(three_people())?;
    let (headers, body) = api.upload(&png_bytes(), "image/png")?;
    assert!(headers.contains("201 Created"), "{}", headers);
    assert!(headers.contains("Access-Control-Allow-Origin: *"));

    let record = json(&body);
    assert_eq!(record["num_people"], 3);
    let confidence = record["confidence_score"].as_f64().unwrap();
    assert!((confidence - 0.8).abs() < 1e-6);
    assert!(record["processing_time"].as_f64().unwrap() >= 0.0);
    assert!(record["timestamp"].as_str().is_some());

    let original = record["original_image_path"].as_str().unwrap();
    let detected = record["detected_image_path"].as_str().unwrap();
    assert!(api.uploads().join(original).is_file());
    assert!(api.uploads().join(detected).is_file());
    Ok(())
}

#[test]
fn upload_accepts_raw_image_body() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    let bytes = png_bytes();
    let head = format!(
        "POST /api/upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: image/png\r\nContent-Length: {}\r\n\r\n",
        bytes.len()
    );
    let (headers, body) = api.send(&head, &bytes)?;
    assert!(headers.contains("201 Created"), "{}", headers);
    let record = json(&body);
    assert_eq!(record["num_people"], 0);
    assert_eq!(record["confidence_score"], 0.0);
    Ok(())
}

#[test]
fn non_image_upload_is_rejected_without_side_effects() -> Result<()> {
    let api = TestApi::new(three_people())?;
    let (headers, body) = api.upload(b"%PDF-1.4", "application/pdf")?;
    assert!(headers.contains("400 Bad Request"), "{}", headers);
    assert_eq!(json(&body)["error"], "File must be an image");
    assert_eq!(upload_file_count(&api), 0);

    let (_, body) = api.get("/api/detections")?;
    assert_eq!(json(&body)["total"], 0);
    Ok(())
}

#[test]
fn undecodable_image_is_bad_request() -> Result<()> {
    let api = TestApi::new(three_people())?;
    let (headers, _) = api.upload(b"not really a png", "image/png")?;
    assert!(headers.contains("400 Bad Request"), "{}", headers);
    assert_eq!(upload_file_count(&api), 0);
    Ok(())
}

#[test]
fn inference_failure_is_generic_server_error() -> Result<()> {
    let api = TestApi::new(StubBackend::failing("tensor shape mismatch at layer 42"))?;
    let (headers, body) = api.upload(&png_bytes(), "image/png")?;
    assert!(headers.contains("500 Internal Server Error"), "{}", headers);
    let text = String::from_utf8_lossy(&body);
    assert!(!text.contains("layer 42"));
    Ok(())
}

#[test]
fn list_filters_paginates_and_reports_total() -> Result<()> {
    let api = TestApi::new(three_people())?;
    let mut ids = Vec::new();
    for _ in 0..5 {
        let (_, body) = api.upload(&png_bytes(), "image/png")?;
        ids.push(json(&body)["id"].as_i64().unwrap());
    }

    let (headers, body) = api.get("/api/detections?skip=0&limit=2")?;
    assert!(headers.contains("200 OK"));
    let first = json(&body);
    assert_eq!(first["total"], 5);
    let first_ids: Vec<i64> = first["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_i64().unwrap())
        .collect();
    assert_eq!(first_ids, vec![ids[4], ids[3]]);

    let (_, body) = api.get("/api/detections?skip=2&limit=2")?;
    let second = json(&body);
    assert_eq!(second["total"], 5);
    let second_ids: Vec<i64> = second["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_i64().unwrap())
        .collect();
    assert_eq!(second_ids, vec![ids[2], ids[1]]);

    let (_, body) = api.get("/api/detections?min_people=3&max_people=3&min_confidence=0.79")?;
    assert_eq!(json(&body)["total"], 5);
    let (_, body) = api.get("/api/detections?min_people=4")?;
    let page = json(&body);
    assert_eq!(page["total"], 0);
    assert!(page["items"].as_array().unwrap().is_empty());
    let (_, body) = api.get("/api/detections?min_confidence=0.81")?;
    assert_eq!(json(&body)["total"], 0);
    Ok(())
}

#[test]
fn list_rejects_out_of_range_params() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    for query in [
        "min_people=-1",
        "max_people=-2",
        "min_confidence=1.5",
        "min_confidence=-0.5",
        "limit=0",
        "skip=18446744073709551615",
    ] {
        let (headers, _) = api.get(&format!("/api/detections?{}", query))?;
        assert!(headers.contains("422"), "{} -> {}", query, headers);
    }
    Ok(())
}

#[test]
fn image_retrieval_and_deletion() -> Result<()> {
    let api = TestApi::new(three_people())?;
    let bytes = png_bytes();
    let (_, body) = api.upload(&bytes, "image/png")?;
    let record = json(&body);
    let id = record["id"].as_i64().unwrap();
    let original = record["original_image_path"].as_str().unwrap().to_string();
    let detected = record["detected_image_path"].as_str().unwrap().to_string();

    let (headers, served) = api.get(&format!("/api/images/{}", original))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("Content-Type: image/jpeg"));
    assert_eq!(served, bytes);

    let (headers, served) = api.get(&format!("/uploads/{}", detected))?;
    assert!(headers.contains("200 OK"));
    assert!(image::load_from_memory(&served).is_ok());

    let (headers, body) = api.delete(&format!("/api/detections/{}", id))?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(json(&body)["message"], "Detection deleted successfully");
    assert!(!api.uploads().join(&original).exists());
    assert!(!api.uploads().join(&detected).exists());

    let (headers, _) = api.get(&format!("/api/images/{}", original))?;
    assert!(headers.contains("404 Not Found"));
    let (_, body) = api.get("/api/detections")?;
    assert_eq!(json(&body)["total"], 0);

    let (headers, _) = api.delete(&format!("/api/detections/{}", id))?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn image_retrieval_refuses_traversal() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    std::fs::write(api.dir.path().join("headcount.secret"), b"secret")?;
    let (headers, _) = api.get("/api/images/..%2Fheadcount.secret")?;
    assert!(headers.contains("404 Not Found"), "{}", headers);
    let (headers, _) = api.get("/api/images/never_saved.jpg")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn routing_edges() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;
    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(json(&body)["status"], "ok");

    let (headers, _) = api.get("/nope")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/api/upload/")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.delete("/api/detections/abc")?;
    assert!(headers.contains("422"));

    let (headers, _) = api.send(
        "OPTIONS /api/upload/ HTTP/1.1\r\nHost: localhost\r\nOrigin: http://localhost:3000\r\n\r\n",
        b"",
    )?;
    assert!(headers.contains("204 No Content"));
    assert!(headers.contains("Access-Control-Allow-Methods"));
    Ok(())
}

#[test]
fn oversized_upload_is_refused() -> Result<()> {
    let settings = ApiSettings {
        max_upload_bytes: 16,
        ..ApiSettings::default()
    };
    let api = TestApi::with_settings(StubBackend::new(), settings)?;
    let head = "POST /api/upload/ HTTP/1.1\r\nHost: localhost\r\nContent-Type: image/png\r\nContent-Length: 1024\r\n\r\n";
    let (headers, _) = api.send(head, b"")?;
    assert!(headers.contains("413"), "{}", headers);
    assert_eq!(upload_file_count(&api), 0);
    Ok(())
}

#[test]
fn stop_waits_for_in_flight_upload() -> Result<()> {
    let mut api = TestApi::new(three_people().delayed(Duration::from_millis(800)))?;
    let addr = api.handle().addr;
    let (head, body) = upload_request(&png_bytes(), "image/png");
    let client = std::thread::spawn(move || send_to(addr, &head, &body));

    let handle = api.api_handle.take().expect("api handle");
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.active_connections() == 0 {
        assert!(Instant::now() < deadline, "upload never reached the server");
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.stop()?;

    let db_path = api.dir.path().join("headcount.db");
    let store = SqliteDetectionStore::open(&db_path.to_string_lossy())?;
    assert_eq!(store.query(&DetectionQuery::default())?.total, 1);
    assert_eq!(upload_file_count(&api), 2);

    let (headers, body) = client.join().expect("client thread")?;
    assert!(headers.contains("201 Created"), "{}", headers);
    assert_eq!(json(&body)["num_people"], 3);
    Ok(())
}
