use serde_json::Value;
use std::{
    sync::{Arc, mpsc},
    thread::JoinHandle,
    time::Instant,
};

use crate::{
    callbacks::Callbacks,
    config::ClientConfig,
    dispatch::{DispatchBridge, InferenceEvent},
    error::ClientError,
    query::{ImageFormat, InferenceBackend, QueryDefaults, RawImage, image_payload},
};

enum HttpJob {
    /// Result is dispatched to the host callbacks.
    Query(Value),
    /// Result is handed back to the caller waiting on the reply channel.
    Blocking(Value, mpsc::Sender<Result<Value, ClientError>>),
}

struct HttpSession {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSession {
    async fn info(&self) -> Result<Value, ClientError> {
        let response = self.client.get(format!("{}/info", self.base_url)).send().await?;
        Self::read_json(response).await
    }

    async fn query(&self, payload: &Value) -> Result<Value, ClientError> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(payload)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Talks to an inference service over HTTP.
///
/// Requests are executed one at a time on a background worker thread, which also
/// delivers the results through the [`DispatchBridge`]. On start the worker fetches
/// `GET /info` (unless disabled in the config); every query is a `POST /query`.
pub struct HttpBackend {
    bridge: Arc<DispatchBridge>,
    defaults: QueryDefaults,
    job_tx: Option<mpsc::Sender<HttpJob>>,
    worker: Option<JoinHandle<()>>,
}

impl HttpBackend {
    /// Validates the configuration and starts the worker thread.
    pub fn new(config: &ClientConfig, callbacks: Callbacks) -> Result<Self, ClientError> {
        let endpoint = config.endpoint()?;
        let bridge = Arc::new(DispatchBridge::new(callbacks));

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let session = HttpSession {
            client: builder.build()?,
            base_url: format!("http://{endpoint}"),
        };

        let (job_tx, job_rx) = mpsc::channel::<HttpJob>();
        let fetch_info = config.fetch_info;

        let worker = std::thread::Builder::new()
            .name("infernum-http".to_string())
            .spawn({
                let bridge = bridge.clone();
                move || run_worker(session, bridge, job_rx, fetch_info)
            })?;

        log::debug!("HTTP backend started for {endpoint}");

        Ok(Self {
            bridge,
            defaults: config.defaults.clone(),
            job_tx: Some(job_tx),
            worker: Some(worker),
        })
    }

    /// The bridge delivering this backend's events to the host callbacks.
    pub fn bridge(&self) -> &Arc<DispatchBridge> {
        &self.bridge
    }

    /// Sends a payload and waits for the response instead of dispatching it.
    ///
    /// Fails with [`ClientError::Reentrant`] when called from a host callback, since
    /// callbacks run on the worker that would have to serve the request.
    pub fn query_blocking(&self, payload: &Value) -> Result<Value, ClientError> {
        if self.on_worker_thread() {
            return Err(ClientError::Reentrant);
        }
        let tx = self.job_tx.as_ref().ok_or(ClientError::Stopped)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(HttpJob::Blocking(payload.clone(), reply_tx))
            .map_err(|_| ClientError::Stopped)?;
        reply_rx.recv().map_err(|_| ClientError::Stopped)?
    }

    /// Stops accepting queries and waits for the pending ones to finish.
    ///
    /// From a host callback the worker is only detached; it exits once the callback
    /// returns and the queue is drained.
    pub fn stop(&mut self) {
        let on_worker = self.on_worker_thread();
        self.job_tx.take();
        if let Some(handle) = self.worker.take() {
            if on_worker {
                log::debug!("HTTP backend stopped from its own worker, not joining");
            } else {
                let _ = handle.join();
            }
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == std::thread::current().id())
    }

    fn submit(&self, payload: Value) {
        let sent = match &self.job_tx {
            Some(tx) => tx.send(HttpJob::Query(payload)).is_ok(),
            None => false,
        };
        if !sent {
            self.bridge
                .dispatch(InferenceEvent::Error(ClientError::Stopped.to_string()));
        }
    }
}

impl InferenceBackend for HttpBackend {
    fn query_image(&self, image: &RawImage<'_>) {
        self.query_image_as(image, self.defaults.format, &self.defaults.key);
    }

    fn query_image_as(&self, image: &RawImage<'_>, format: ImageFormat, key: &str) {
        match image_payload(image, format, key) {
            Ok(payload) => self.submit(payload),
            Err(err) => self.bridge.dispatch(InferenceEvent::Error(err.to_string())),
        }
    }

    fn query_json(&self, payload: &Value) {
        self.submit(payload.clone());
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    session: HttpSession,
    bridge: Arc<DispatchBridge>,
    job_rx: mpsc::Receiver<HttpJob>,
    fetch_info: bool,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Failed to start the HTTP runtime: {err}");
            bridge.dispatch(InferenceEvent::Error(ClientError::Io(err).to_string()));
            return;
        }
    };

    if fetch_info {
        match runtime.block_on(session.info()) {
            Ok(info) => bridge.dispatch(InferenceEvent::Info(info)),
            Err(err) => bridge.dispatch(InferenceEvent::Error(err.to_string())),
        }
    }

    while let Ok(job) = job_rx.recv() {
        log::debug!("Sending a new query");
        let start_time = Instant::now();

        match job {
            HttpJob::Query(payload) => {
                let event = match runtime.block_on(session.query(&payload)) {
                    Ok(data) => InferenceEvent::Data(data),
                    Err(err) => InferenceEvent::Error(err.to_string()),
                };
                log::debug!("Query completed in {:?}", start_time.elapsed());
                bridge.dispatch(event);
            }
            HttpJob::Blocking(payload, reply_tx) => {
                let result = runtime.block_on(session.query(&payload));
                log::debug!("Query completed in {:?}", start_time.elapsed());
                let _ = reply_tx.send(result);
            }
        }
    }

    log::debug!("HTTP worker stopped");
}
