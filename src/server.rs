use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{info, warn};
use prometheus::Encoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::Filter;

use crate::config::Config;
use crate::emulator::{CpuState, Emulator};
use crate::image::Image;
use crate::metrics::{
    forget_emulator, init_metrics, record_api_request, record_memory_operation,
    record_snapshot_operation, set_active_emulators, Timer, REGISTRY,
};
use crate::snapshots::Snapshot;

const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct EmulatorState {
    pub id: String,
    pub cpu: CpuState,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntryPoint {
    pub entry_point: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryWrite {
    pub address: u16,
    pub value: u8,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRead {
    pub address: u16,
    pub length: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct MemoryData {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ProgramLoad {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ImageLoad {
    pub address: Option<u16>,
    pub image_base64: String,
}

#[derive(Debug, Serialize)]
pub struct LoadResult {
    pub address: u16,
    pub bytes_loaded: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteSteps {
    pub steps: u64,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub steps_executed: u64,
    pub halted: bool,
    pub final_state: CpuState,
}

#[derive(Debug, Deserialize)]
pub struct CreateSnapshot {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RestoreSnapshot {
    pub snapshot: Snapshot,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Failed request that still carries data, e.g. the machine state after a fault
    pub fn failure(data: T, error: String) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(error),
        }
    }
}

pub type EmulatorMap = Arc<Mutex<HashMap<String, Emulator>>>;

pub fn new_emulator_map() -> EmulatorMap {
    Arc::new(Mutex::new(HashMap::new()))
}

// A panic while holding the lock leaves the sessions usable
fn lock(emulators: &EmulatorMap) -> MutexGuard<'_, HashMap<String, Emulator>> {
    emulators.lock().unwrap_or_else(PoisonError::into_inner)
}

fn respond<T: Serialize>(
    method: &str,
    endpoint: &str,
    timer: Timer,
    status: StatusCode,
    response: ApiResponse<T>,
) -> warp::reply::WithStatus<warp::reply::Json> {
    record_api_request(method, endpoint, status.as_u16(), timer.elapsed());
    warp::reply::with_status(warp::reply::json(&response), status)
}

fn not_found(method: &str, endpoint: &str, timer: Timer) -> warp::reply::WithStatus<warp::reply::Json> {
    respond::<()>(
        method,
        endpoint,
        timer,
        StatusCode::NOT_FOUND,
        ApiResponse::error("Emulator not found".to_string()),
    )
}

fn bad_request(
    method: &str,
    endpoint: &str,
    timer: Timer,
    error: String,
) -> warp::reply::WithStatus<warp::reply::Json> {
    respond::<()>(method, endpoint, timer, StatusCode::BAD_REQUEST, ApiResponse::error(error))
}

// Empty bodies are allowed where every field is optional
fn parse_optional<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("Invalid request body: {}", e))
}

fn with_emulators(
    emulators: EmulatorMap,
) -> impl Filter<Extract = (EmulatorMap,), Error = Infallible> + Clone {
    warp::any().map(move || emulators.clone())
}

fn with_config(config: Arc<Config>) -> impl Filter<Extract = (Arc<Config>,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

// Optional bodies; content-length may be absent
fn raw_body() -> impl Filter<Extract = (Bytes,), Error = warp::Rejection> + Clone {
    warp::body::bytes()
}

/// Every route of the service, ready to be served or driven by `warp::test`.
pub fn routes(
    config: Arc<Config>,
    emulators: EmulatorMap,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "DELETE"]);

    let create_emulator = warp::path("emulator")
        .and(warp::path::end())
        .and(warp::post())
        .and(raw_body())
        .and(with_emulators(emulators.clone()))
        .and(with_config(config.clone()))
        .and_then(create_emulator_handler);

    let get_state = warp::path!("emulator" / String)
        .and(warp::get())
        .and(with_emulators(emulators.clone()))
        .and_then(get_state_handler);

    let delete_emulator = warp::path!("emulator" / String)
        .and(warp::delete())
        .and(with_emulators(emulators.clone()))
        .and_then(delete_emulator_handler);

    let list_emulators = warp::path("emulators")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_emulators(emulators.clone()))
        .and_then(list_emulators_handler);

    let reset_emulator = warp::path!("emulator" / String / "reset")
        .and(warp::post())
        .and(raw_body())
        .and(with_emulators(emulators.clone()))
        .and(with_config(config.clone()))
        .and_then(reset_handler);

    let load_program = warp::path!("emulator" / String / "program")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators.clone()))
        .and_then(load_program_handler);

    let load_image = warp::path!("emulator" / String / "image")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators.clone()))
        .and(with_config(config.clone()))
        .and_then(load_image_handler);

    let step_emulator = warp::path!("emulator" / String / "step")
        .and(warp::post())
        .and(with_emulators(emulators.clone()))
        .and_then(step_handler);

    let execute_steps = warp::path!("emulator" / String / "execute")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators.clone()))
        .and(with_config(config.clone()))
        .and_then(execute_handler);

    let read_memory = warp::path!("emulator" / String / "memory")
        .and(warp::get())
        .and(warp::query::<MemoryRead>())
        .and(with_emulators(emulators.clone()))
        .and_then(read_memory_handler);

    let write_memory = warp::path!("emulator" / String / "memory")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators.clone()))
        .and_then(write_memory_handler);

    let create_snapshot = warp::path!("emulator" / String / "snapshot")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators.clone()))
        .and_then(snapshot_handler);

    let restore_snapshot = warp::path!("emulator" / String / "restore")
        .and(warp::post())
        .and(json_body())
        .and(with_emulators(emulators))
        .and_then(restore_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    create_emulator
        .or(get_state)
        .or(delete_emulator)
        .or(list_emulators)
        .or(reset_emulator)
        .or(load_program)
        .or(load_image)
        .or(step_emulator)
        .or(execute_steps)
        .or(read_memory)
        .or(write_memory)
        .or(create_snapshot)
        .or(restore_snapshot)
        .or(metrics)
        .with(cors)
}

pub async fn run_server(config: Config) {
    init_metrics();

    let addr = config.socket_addr();
    let routes = routes(Arc::new(config), new_emulator_map());

    info!("6502 emulator server listening on http://{}", addr);
    info!("  POST   /emulator              - Create emulator session");
    info!("  GET    /emulator/:id          - Get emulator state");
    info!("  DELETE /emulator/:id          - Delete emulator session");
    info!("  GET    /emulators             - List emulator sessions");
    info!("  POST   /emulator/:id/reset    - Cold reset");
    info!("  POST   /emulator/:id/program  - Load raw bytes");
    info!("  POST   /emulator/:id/image    - Load EF or raw image (base64)");
    info!("  POST   /emulator/:id/step     - Execute one instruction");
    info!("  POST   /emulator/:id/execute  - Execute up to N instructions");
    info!("  GET    /emulator/:id/memory   - Read memory");
    info!("  POST   /emulator/:id/memory   - Write memory");
    info!("  POST   /emulator/:id/snapshot - Capture snapshot");
    info!("  POST   /emulator/:id/restore  - Restore snapshot");
    info!("  GET    /metrics               - Prometheus metrics");

    warp::serve(routes).run(addr).await;
}

async fn create_emulator_handler(
    body: Bytes,
    emulators: EmulatorMap,
    config: Arc<Config>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let request: EntryPoint = match parse_optional(&body) {
        Ok(request) => request,
        Err(e) => return Ok(bad_request("POST", "/emulator", timer, e)),
    };

    let mut emulators_lock = lock(&emulators);
    if emulators_lock.len() >= config.max_sessions {
        return Ok(respond::<()>(
            "POST",
            "/emulator",
            timer,
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::error(format!("Session limit of {} reached", config.max_sessions)),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let mut emulator = Emulator::new(id.clone());
    emulator.reset(request.entry_point.unwrap_or(config.default_entry_point));
    let state = emulator.state();

    emulators_lock.insert(id.clone(), emulator);
    set_active_emulators(emulators_lock.len());
    info!("created emulator {}", id);

    Ok(respond(
        "POST",
        "/emulator",
        timer,
        StatusCode::CREATED,
        ApiResponse::success(EmulatorState { id, cpu: state }),
    ))
}

async fn get_state_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let emulators_lock = lock(&emulators);

    Ok(match emulators_lock.get(&id) {
        Some(emulator) => respond(
            "GET",
            "/emulator/:id",
            timer,
            StatusCode::OK,
            ApiResponse::success(EmulatorState {
                id: id.clone(),
                cpu: emulator.state(),
            }),
        ),
        None => not_found("GET", "/emulator/:id", timer),
    })
}

async fn delete_emulator_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    Ok(match emulators_lock.remove(&id) {
        Some(_) => {
            set_active_emulators(emulators_lock.len());
            forget_emulator(&id);
            info!("deleted emulator {}", id);
            respond(
                "DELETE",
                "/emulator/:id",
                timer,
                StatusCode::OK,
                ApiResponse::success(format!("Emulator {} deleted", id)),
            )
        }
        None => not_found("DELETE", "/emulator/:id", timer),
    })
}

async fn list_emulators_handler(emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let emulators_lock = lock(&emulators);

    let mut sessions: Vec<&Emulator> = emulators_lock.values().collect();
    sessions.sort_by_key(|emulator| emulator.created_at());
    let emulator_list: Vec<EmulatorState> = sessions
        .into_iter()
        .map(|emulator| EmulatorState {
            id: emulator.id().to_string(),
            cpu: emulator.state(),
        })
        .collect();

    Ok(respond("GET", "/emulators", timer, StatusCode::OK, ApiResponse::success(emulator_list)))
}

async fn reset_handler(
    id: String,
    body: Bytes,
    emulators: EmulatorMap,
    config: Arc<Config>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let request: EntryPoint = match parse_optional(&body) {
        Ok(request) => request,
        Err(e) => return Ok(bad_request("POST", "/emulator/:id/reset", timer, e)),
    };
    let mut emulators_lock = lock(&emulators);

    Ok(match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.reset(request.entry_point.unwrap_or(config.default_entry_point));
            respond(
                "POST",
                "/emulator/:id/reset",
                timer,
                StatusCode::OK,
                ApiResponse::success(EmulatorState {
                    id: id.clone(),
                    cpu: emulator.state(),
                }),
            )
        }
        None => not_found("POST", "/emulator/:id/reset", timer),
    })
}

async fn load_program_handler(
    id: String,
    request: ProgramLoad,
    emulators: EmulatorMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => return Ok(not_found("POST", "/emulator/:id/program", timer)),
    };

    Ok(match emulator.load_program(request.address, &request.data) {
        Ok(bytes_loaded) => respond(
            "POST",
            "/emulator/:id/program",
            timer,
            StatusCode::OK,
            ApiResponse::success(LoadResult {
                address: request.address,
                bytes_loaded,
            }),
        ),
        Err(e) => bad_request("POST", "/emulator/:id/program", timer, e.to_string()),
    })
}

async fn load_image_handler(
    id: String,
    request: ImageLoad,
    emulators: EmulatorMap,
    config: Arc<Config>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let bytes = match STANDARD.decode(&request.image_base64) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(bad_request("POST", "/emulator/:id/image", timer, format!("Invalid base64: {}", e))),
    };
    let image = match Image::from_bytes(&bytes) {
        Ok(image) => image,
        Err(e) => return Ok(bad_request("POST", "/emulator/:id/image", timer, e.to_string())),
    };
    let address = request.address.unwrap_or(config.default_load_address);

    let mut emulators_lock = lock(&emulators);
    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => return Ok(not_found("POST", "/emulator/:id/image", timer)),
    };

    Ok(match emulator.load_image(&image, address) {
        Ok(bytes_loaded) => respond(
            "POST",
            "/emulator/:id/image",
            timer,
            StatusCode::OK,
            ApiResponse::success(LoadResult { address, bytes_loaded }),
        ),
        Err(e) => bad_request("POST", "/emulator/:id/image", timer, e.to_string()),
    })
}

async fn step_handler(id: String, emulators: EmulatorMap) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => return Ok(not_found("POST", "/emulator/:id/step", timer)),
    };

    let result = emulator.step();
    let state = EmulatorState {
        id: id.clone(),
        cpu: emulator.state(),
    };
    Ok(match result {
        Ok(_) => respond("POST", "/emulator/:id/step", timer, StatusCode::OK, ApiResponse::success(state)),
        Err(e) => respond(
            "POST",
            "/emulator/:id/step",
            timer,
            StatusCode::UNPROCESSABLE_ENTITY,
            ApiResponse::failure(state, e.to_string()),
        ),
    })
}

async fn execute_handler(
    id: String,
    request: ExecuteSteps,
    emulators: EmulatorMap,
    config: Arc<Config>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => return Ok(not_found("POST", "/emulator/:id/execute", timer)),
    };

    let steps = request.steps.min(config.max_steps_per_request);
    let before = emulator.cpu().get_instructions();
    let result = emulator.run_for(steps);
    let execution = ExecutionResult {
        steps_executed: emulator.cpu().get_instructions() - before,
        halted: emulator.cpu().is_halted(),
        final_state: emulator.state(),
    };

    Ok(match result {
        Ok(_) => respond("POST", "/emulator/:id/execute", timer, StatusCode::OK, ApiResponse::success(execution)),
        Err(e) => {
            warn!("emulator {} faulted after {} steps", id, execution.steps_executed);
            respond(
                "POST",
                "/emulator/:id/execute",
                timer,
                StatusCode::UNPROCESSABLE_ENTITY,
                ApiResponse::failure(execution, e.to_string()),
            )
        }
    })
}

async fn read_memory_handler(
    id: String,
    query: MemoryRead,
    emulators: EmulatorMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let emulators_lock = lock(&emulators);

    Ok(match emulators_lock.get(&id) {
        Some(emulator) => {
            record_memory_operation("read", &id);
            let length = query.length.unwrap_or(1);
            respond(
                "GET",
                "/emulator/:id/memory",
                timer,
                StatusCode::OK,
                ApiResponse::success(MemoryData {
                    address: query.address,
                    data: emulator.read_memory(query.address, length),
                }),
            )
        }
        None => not_found("GET", "/emulator/:id/memory", timer),
    })
}

async fn write_memory_handler(
    id: String,
    request: MemoryWrite,
    emulators: EmulatorMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    Ok(match emulators_lock.get_mut(&id) {
        Some(emulator) => {
            emulator.write_memory(request.address, request.value);
            record_memory_operation("write", &id);
            respond(
                "POST",
                "/emulator/:id/memory",
                timer,
                StatusCode::OK,
                ApiResponse::success(format!(
                    "Wrote ${:02X} to address ${:04X}",
                    request.value, request.address
                )),
            )
        }
        None => not_found("POST", "/emulator/:id/memory", timer),
    })
}

async fn snapshot_handler(
    id: String,
    request: CreateSnapshot,
    emulators: EmulatorMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let emulators_lock = lock(&emulators);

    Ok(match emulators_lock.get(&id) {
        Some(emulator) => {
            let snapshot = emulator.snapshot(&request.name);
            record_snapshot_operation("capture", true);
            respond("POST", "/emulator/:id/snapshot", timer, StatusCode::OK, ApiResponse::success(snapshot))
        }
        None => not_found("POST", "/emulator/:id/snapshot", timer),
    })
}

async fn restore_handler(
    id: String,
    request: RestoreSnapshot,
    emulators: EmulatorMap,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let mut emulators_lock = lock(&emulators);

    let emulator = match emulators_lock.get_mut(&id) {
        Some(emulator) => emulator,
        None => return Ok(not_found("POST", "/emulator/:id/restore", timer)),
    };

    Ok(match emulator.restore(&request.snapshot) {
        Ok(()) => {
            record_snapshot_operation("restore", true);
            respond(
                "POST",
                "/emulator/:id/restore",
                timer,
                StatusCode::OK,
                ApiResponse::success(EmulatorState {
                    id: id.clone(),
                    cpu: emulator.state(),
                }),
            )
        }
        Err(e) => {
            record_snapshot_operation("restore", false);
            warn!("emulator {}: snapshot restore failed: {}", id, e);
            bad_request("POST", "/emulator/:id/restore", timer, e.to_string())
        }
    })
}

async fn metrics_handler() -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            Ok(warp::reply::with_status(
                warp::reply::with_header(metrics_text, "content-type", encoder.format_type()),
                StatusCode::OK,
            ))
        }
        Err(e) => {
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            Ok(warp::reply::with_status(
                warp::reply::with_header(
                    format!("Error encoding metrics: {}", e),
                    "content-type",
                    "text/plain",
                ),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}
