//! An in-process FirecREST server for end-to-end tests.
//!
//! Task responses are scripted per task identifier: each poll consumes the
//! next scripted record and the last record repeats forever.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use axum::Form;
use axum::Json;
use axum::Router;
use axum::extract::Multipart;
use axum::extract::Path as UrlPath;
use axum::extract::Query;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use firecrest::Config;
use firecrest::config::RateLimitConfig;
use serde_json::Value;
use serde_json::json;

/// The client identifier the mock accepts.
pub const CLIENT_ID: &str = "f7t-test";

/// The client secret the mock accepts.
pub const CLIENT_SECRET: &str = "hunter2";

/// The job states that end a job.
const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "BOOT_FAIL",
    "DEADLINE",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
];

/// A batch script received by the mock.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The target system.
    pub system: String,
    /// The uploaded file name.
    pub file_name: String,
    /// The script content.
    pub content: String,
    /// The account, if given.
    pub account: Option<String>,
}

/// The mutable state of the mock.
#[derive(Debug, Default)]
pub struct MockState {
    /// The base URL of the mock.
    pub base: String,
    /// The number of tokens issued.
    pub tokens_issued: usize,
    /// The lifetime reported for issued tokens, in seconds.
    ///
    /// Defaults to 300 seconds.
    pub expires_in: Option<u64>,
    /// The tokens the mock accepts and when each was issued.
    pub issued: HashMap<String, Instant>,
    /// The number of requests rejected for a missing or bad token.
    pub rejected: usize,
    /// Scripted task records by task identifier.
    pub tasks: HashMap<String, VecDeque<Value>>,
    /// The number of status requests made for each task.
    pub task_polls: HashMap<String, usize>,
    /// Task identifiers to hand out for the next submissions.
    pub submit_tasks: VecDeque<String>,
    /// The submissions received.
    pub submissions: Vec<Submission>,
    /// Scripted scheduler states by job identifier.
    pub jobs: HashMap<String, VecDeque<String>>,
    /// Output paths by job identifier.
    pub job_outputs: HashMap<String, String>,
    /// Remote files by path.
    pub files: HashMap<String, Vec<u8>>,
    /// The systems and their status.
    pub systems: Vec<(String, String)>,
    /// Staged download links by task identifier: remote path and validity.
    pub links: HashMap<String, (String, bool)>,
    /// Staged upload targets by task identifier.
    pub uploads: HashMap<String, String>,
    /// The number of upcoming API requests to fail with 503.
    pub unavailable: usize,
    /// The number of upcoming object storage downloads to fail with 500.
    pub broken_objects: usize,
    /// A counter for generated identifiers.
    pub counter: usize,
}

impl MockState {
    /// Generates a new identifier with the given prefix.
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{counter}", counter = self.counter)
    }

    /// Determines if a system exists.
    fn has_system(&self, name: &str) -> bool {
        self.systems.iter().any(|(n, _)| n == name)
    }

    /// Gets the next scripted state of a job.
    fn next_state(&mut self, job_id: &str) -> Option<String> {
        let states = self.jobs.get_mut(job_id)?;
        if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().cloned()
        }
    }

    /// Builds the scheduler record of a job.
    fn job_record(&self, job_id: &str, state: &str) -> Value {
        json!({
            "jobid": job_id,
            "name": "script.sh",
            "state": state,
            "partition": "normal",
            "nodes": "1",
            "user": "someone",
            "job_file_out": self.job_outputs.get(job_id),
        })
    }
}

/// Builds a task record.
pub fn task_record(id: &str, status: u16, data: Value) -> Value {
    let description = match status {
        100 => "Queued",
        110 => "Waiting for Form URL from Object Storage to be retrieved",
        111 => "Form URL from Object Storage received",
        112 => "Object Storage confirms that upload to Object Storage has finished",
        114 => "Upload from Object Storage to server has finished",
        115 => "Upload from Object Storage to server has failed",
        116 => "Started upload from filesystem to Object Storage",
        117 => "Upload from filesystem to Object Storage has finished succesfully",
        118 => "Upload from filesystem to Object Storage has failed",
        200 => "Finished successfully",
        _ => "Finished with errors",
    };

    json!({
        "hash_id": id,
        "status": status.to_string(),
        "description": description,
        "service": "compute",
        "data": data,
    })
}

/// A running mock server.
#[derive(Debug, Clone)]
pub struct Mock {
    /// The base URL of the server; ends with a slash.
    pub base: String,
    /// The shared state.
    state: Arc<Mutex<MockState>>,
}

impl Mock {
    /// Starts a mock server on an ephemeral port.
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{addr}/", addr = listener.local_addr().unwrap());

        let state = Arc::new(Mutex::new(MockState {
            base: base.clone(),
            systems: vec![
                ("daint".to_string(), "available".to_string()),
                ("eiger".to_string(), "not available".to_string()),
            ],
            ..Default::default()
        }));

        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self { base, state }
    }

    /// Locks the state of the mock.
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Gets a client configuration for the mock with no rate limits or
    /// polling delays.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.url = Some(self.base.parse().unwrap());
        config.insecure = true;
        config.auth.client_id = Some(CLIENT_ID.to_string());
        config.auth.client_secret = Some(CLIENT_SECRET.into());
        config.auth.token_url = Some(format!("{base}auth/token", base = self.base).parse().unwrap());
        config.rate_limits = RateLimitConfig::uniform(0.0);
        config.polling.task_interval = Some(0.0);
        config.polling.job_interval = Some(0.0);
        config.http.retries = Some(0);
        config
    }

    /// Scripts the records returned for a task.
    pub fn script_task(&self, id: &str, records: impl IntoIterator<Item = Value>) {
        self.state()
            .tasks
            .insert(id.to_string(), records.into_iter().collect());
    }

    /// Scripts the task returned by the next submission.
    pub fn script_submission(&self, id: &str, records: impl IntoIterator<Item = Value>) {
        self.script_task(id, records);
        self.state().submit_tasks.push_back(id.to_string());
    }

    /// Scripts the scheduler states of a job.
    pub fn script_job(&self, job_id: &str, states: &[&str]) {
        self.state().jobs.insert(
            job_id.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Adds a remote file.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.state().files.insert(path.to_string(), content.into());
    }

    /// Gets a remote file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Revokes every token issued so far.
    pub fn revoke_tokens(&self) {
        self.state().issued.clear();
    }

    /// Gets the number of status requests made for a task.
    pub fn task_polls(&self, id: &str) -> usize {
        self.state().task_polls.get(id).copied().unwrap_or_default()
    }
}

/// The shared state type of the handlers.
type Shared = Arc<Mutex<MockState>>;

/// Creates the router of the mock.
fn router(state: Shared) -> Router {
    let api = Router::new()
        .route("/compute/jobs/upload", post(submit))
        .route("/compute/jobs", get(queue))
        .route("/compute/acct", get(acct))
        .route("/tasks/{id}", get(task))
        .route("/status/systems", get(systems))
        .route("/status/systems/{name}", get(system))
        .route("/reservations", get(reservations))
        .route("/utilities/view", get(view))
        .route("/utilities/download", get(download))
        .route("/utilities/upload", post(upload))
        .route("/storage/xfer-external/download", post(external_download))
        .route("/storage/xfer-external/upload", post(external_upload))
        .route("/storage/xfer-external/invalidate", post(invalidate))
        .route_layer(from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/auth/token", post(token))
        .route("/object/{id}", get(object_get).post(object_post))
        .merge(api)
        .with_state(state)
}

/// Builds an error response in the FirecREST shape.
fn failure(status: StatusCode, header: Option<(&'static str, &str)>, description: &str) -> Response {
    let mut response = (status, Json(json!({ "description": description }))).into_response();
    if let Some((name, value)) = header {
        response
            .headers_mut()
            .insert(name, value.parse().unwrap());
    }
    response
}

/// Gets the target system of a request.
fn machine(state: &MockState, headers: &HeaderMap) -> Result<String, Response> {
    let name = headers
        .get("x-machine-name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if state.has_system(&name) {
        Ok(name)
    } else {
        Err(failure(
            StatusCode::BAD_REQUEST,
            Some(("x-machine-does-not-exist", "Machine does not exist")),
            &format!("Machine `{name}` does not exist"),
        ))
    }
}

/// Rejects requests without a token issued by the mock.
async fn require_bearer(State(state): State<Shared>, request: Request, next: Next) -> Response {
    {
        let mut state = state.lock().unwrap();
        let lifetime = Duration::from_secs(state.expires_in.unwrap_or(300));
        let valid = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|token| state.issued.get(token))
            .is_some_and(|issued| issued.elapsed() < lifetime);

        if !valid {
            state.rejected += 1;
            return failure(StatusCode::UNAUTHORIZED, None, "Invalid token");
        }

        if state.unavailable > 0 {
            state.unavailable -= 1;
            return failure(StatusCode::SERVICE_UNAVAILABLE, None, "Service unavailable");
        }
    }

    next.run(request).await
}

/// Issues tokens for the client-credentials grant.
async fn token(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    let valid = form.get("grant_type").map(String::as_str) == Some("client_credentials")
        && form.get("client_id").map(String::as_str) == Some(CLIENT_ID)
        && form.get("client_secret").map(String::as_str) == Some(CLIENT_SECRET);

    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "unauthorized_client",
                "error_description": "Invalid client secret",
            })),
        )
            .into_response();
    }

    let mut state = state.lock().unwrap();
    state.tokens_issued += 1;
    let token = format!("token-{n}", n = state.tokens_issued);
    state.issued.insert(token.clone(), Instant::now());
    Json(json!({
        "access_token": token,
        "expires_in": state.expires_in.unwrap_or(300),
        "token_type": "Bearer",
    }))
    .into_response()
}

/// Accepts a batch script.
async fn submit(State(state): State<Shared>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let mut file_name = String::new();
    let mut content = String::new();
    let mut account = None;

    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name().unwrap_or_default() {
            "file" => {
                file_name = field.file_name().unwrap_or_default().to_string();
                content = field.text().await.unwrap();
            }
            "account" => account = Some(field.text().await.unwrap()),
            _ => {}
        }
    }

    let mut state = state.lock().unwrap();
    let system = match machine(&state, &headers) {
        Ok(system) => system,
        Err(response) => return response,
    };

    let task_id = match state.submit_tasks.pop_front() {
        Some(id) => id,
        None => {
            // Unscripted submissions create a job that completes immediately
            let id = state.next_id("submit");
            let job_id = (1000 + state.counter).to_string();
            let out = format!("/home/someone/slurm-{job_id}.out");
            state
                .tasks
                .insert(id.clone(), VecDeque::from([task_record(&id, 200, json!({
                    "jobid": job_id.parse::<u64>().unwrap(),
                    "result": "Job submitted",
                    "job_file": format!("/home/someone/{file_name}"),
                    "job_file_out": out,
                    "job_file_err": out,
                }))]));
            state.jobs.insert(job_id.clone(), VecDeque::from(["COMPLETED".to_string()]));
            state.job_outputs.insert(job_id, out.clone());
            state.files.insert(out, b"hello from the job\n".to_vec());
            id
        }
    };

    state.submissions.push(Submission {
        system,
        file_name,
        content,
        account,
    });

    (
        StatusCode::CREATED,
        Json(json!({
            "success": "Task created",
            "task_id": task_id,
            "task_url": format!("/tasks/{task_id}"),
        })),
    )
        .into_response()
}

/// Creates a completed scheduler query task.
fn query_task(state: &mut MockState, data: Value) -> Response {
    let id = state.next_id("query");
    state
        .tasks
        .insert(id.clone(), VecDeque::from([task_record(&id, 200, data)]));

    Json(json!({ "success": "Task created", "task_id": id })).into_response()
}

/// Gets the requested job identifiers of a scheduler query.
fn requested_jobs(state: &MockState, query: &HashMap<String, String>) -> Vec<String> {
    match query.get("jobs") {
        Some(ids) => ids.split(',').map(str::to_string).collect(),
        None => {
            let mut ids: Vec<_> = state.jobs.keys().cloned().collect();
            ids.sort();
            ids
        }
    }
}

/// Lists the active jobs, keyed by position.
async fn queue(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    let mut listing = serde_json::Map::new();
    for id in requested_jobs(&state, &query) {
        if let Some(s) = state.next_state(&id)
            && !TERMINAL_STATES.contains(&s.as_str())
        {
            let record = state.job_record(&id, &s);
            listing.insert(listing.len().to_string(), record);
        }
    }

    query_task(&mut state, Value::Object(listing))
}

/// Lists the accounting records of jobs.
async fn acct(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    let mut listing = Vec::new();
    for id in requested_jobs(&state, &query) {
        if let Some(s) = state.next_state(&id) {
            listing.push(state.job_record(&id, &s));
        }
    }

    query_task(&mut state, Value::Array(listing))
}

/// Gets the status of a task.
async fn task(State(state): State<Shared>, UrlPath(id): UrlPath<String>) -> Response {
    let mut state = state.lock().unwrap();
    *state.task_polls.entry(id.clone()).or_default() += 1;

    let Some(records) = state.tasks.get_mut(&id) else {
        return failure(StatusCode::NOT_FOUND, None, "Task does not exist");
    };

    let record = if records.len() > 1 {
        records.pop_front().unwrap()
    } else {
        records.front().cloned().unwrap()
    };

    Json(json!({ "task": record })).into_response()
}

/// Lists the systems.
async fn systems(State(state): State<Shared>) -> Response {
    let state = state.lock().unwrap();
    let out: Vec<_> = state
        .systems
        .iter()
        .map(|(name, status)| json!({ "system": name, "status": status, "description": "" }))
        .collect();

    Json(json!({ "description": "List of systems with status and description.", "out": out }))
        .into_response()
}

/// Gets a single system.
async fn system(State(state): State<Shared>, UrlPath(name): UrlPath<String>) -> Response {
    let state = state.lock().unwrap();
    match state.systems.iter().find(|(n, _)| *n == name) {
        Some((name, status)) => Json(json!({
            "description": "System information",
            "out": { "system": name, "status": status, "description": "" },
        }))
        .into_response(),
        None => failure(StatusCode::BAD_REQUEST, None, "System does not exist"),
    }
}

/// Lists the reservations.
async fn reservations(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    Json(json!({ "success": [] })).into_response()
}

/// Gets a query parameter naming a remote file that must exist.
fn existing_path(
    state: &MockState,
    query: &HashMap<String, String>,
    name: &str,
) -> Result<String, Response> {
    let path = query.get(name).cloned().unwrap_or_default();
    if state.files.contains_key(&path) {
        Ok(path)
    } else {
        Err(failure(
            StatusCode::BAD_REQUEST,
            Some(("x-invalid-path", "path is an invalid path")),
            "Error on file operation",
        ))
    }
}

/// Views a remote file.
async fn view(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    match existing_path(&state, &query, "targetPath") {
        Ok(path) => Json(json!({
            "description": "File content successfully returned",
            "output": String::from_utf8_lossy(&state.files[&path]),
        }))
        .into_response(),
        Err(response) => response,
    }
}

/// Downloads a remote file.
async fn download(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    match existing_path(&state, &query, "sourcePath") {
        Ok(path) => state.files[&path].clone().into_response(),
        Err(response) => response,
    }
}

/// Reads the fields of a multipart upload.
async fn read_fields(mut multipart: Multipart) -> HashMap<String, (Option<String>, Vec<u8>)> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.unwrap();
        fields.insert(name, (file_name, bytes.to_vec()));
    }
    fields
}

/// Uploads a small file into a remote directory.
async fn upload(State(state): State<Shared>, headers: HeaderMap, multipart: Multipart) -> Response {
    let fields = read_fields(multipart).await;

    let mut state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    let (Some((_, target)), Some((Some(name), content))) =
        (fields.get("targetPath"), fields.get("file"))
    else {
        return failure(StatusCode::BAD_REQUEST, None, "Missing upload fields");
    };

    let target = String::from_utf8_lossy(target);
    let path = format!("{dir}/{name}", dir = target.trim_end_matches('/'));
    state.files.insert(path, content.clone());

    (
        StatusCode::CREATED,
        Json(json!({ "description": "File upload successful" })),
    )
        .into_response()
}

/// Starts staging a remote file.
async fn external_download(
    State(state): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    let path = form.get("sourcePath").cloned().unwrap_or_default();
    let id = state.next_id("download");
    let records = if state.files.contains_key(&path) {
        let link = format!("{base}object/{id}", base = state.base);
        state.links.insert(id.clone(), (path, true));
        vec![
            task_record(&id, 116, Value::Null),
            task_record(&id, 117, json!(link)),
        ]
    } else {
        vec![
            task_record(&id, 116, Value::Null),
            task_record(&id, 118, json!(format!("{path}: No such file or directory"))),
        ]
    };
    state.tasks.insert(id.clone(), records.into());

    (
        StatusCode::CREATED,
        Json(json!({ "success": "Task created", "task_id": id })),
    )
        .into_response()
}

/// Starts a staged upload.
async fn external_upload(
    State(state): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = machine(&state, &headers) {
        return response;
    }

    let target = form.get("targetPath").cloned().unwrap_or_default();
    let id = state.next_id("upload");
    let url = format!("{base}object/{id}", base = state.base);
    state.uploads.insert(id.clone(), target);
    state.tasks.insert(
        id.clone(),
        VecDeque::from([
            task_record(&id, 110, Value::Null),
            task_record(
                &id,
                111,
                json!({
                    "msg": "Form URL ready",
                    "parameters": {
                        "method": "POST",
                        "url": url,
                        "data": { "key": id, "policy": "signed" },
                        "headers": {},
                        "json": {},
                        "params": {},
                    },
                }),
            ),
        ]),
    );

    (
        StatusCode::CREATED,
        Json(json!({ "success": "Task created", "task_id": id })),
    )
        .into_response()
}

/// Invalidates a staged download link.
async fn invalidate(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let id = headers
        .get("x-task-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mut state = state.lock().unwrap();
    match state.links.get_mut(id) {
        Some((_, valid)) => {
            *valid = false;
            (
                StatusCode::CREATED,
                Json(json!({ "success": "URL invalidated successfully" })),
            )
                .into_response()
        }
        None => failure(StatusCode::BAD_REQUEST, None, "Task does not exist"),
    }
}

/// Serves a staged file from object storage.
async fn object_get(State(state): State<Shared>, UrlPath(id): UrlPath<String>) -> Response {
    let mut state = state.lock().unwrap();
    if state.broken_objects > 0 {
        state.broken_objects -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
    }

    match state.links.get(&id) {
        Some((path, true)) => state.files[path].clone().into_response(),
        _ => (StatusCode::FORBIDDEN, "Request has expired").into_response(),
    }
}

/// Receives a staged upload into object storage.
async fn object_post(
    State(state): State<Shared>,
    UrlPath(id): UrlPath<String>,
    multipart: Multipart,
) -> Response {
    let fields = read_fields(multipart).await;

    let mut state = state.lock().unwrap();
    let Some(target) = state.uploads.get(&id).cloned() else {
        return (StatusCode::FORBIDDEN, "Request has expired").into_response();
    };

    let signed = fields.get("key").is_some_and(|(_, key)| key == id.as_bytes());
    let Some((_, content)) = fields.get("file").filter(|_| signed) else {
        return (StatusCode::BAD_REQUEST, "Malformed upload").into_response();
    };

    state.files.insert(target, content.clone());
    state.tasks.insert(
        id.clone(),
        VecDeque::from([
            task_record(&id, 112, Value::Null),
            task_record(&id, 114, Value::Null),
        ]),
    );

    StatusCode::NO_CONTENT.into_response()
}
