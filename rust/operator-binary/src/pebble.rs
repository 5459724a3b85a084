//! Minimal client for the Pebble API of the workload container, spoken over its Unix socket.

use std::path::{Path, PathBuf};

use hyper::{
    body::Incoming,
    client::conn::http1,
    header::{self, HeaderValue, InvalidHeaderValue},
    Method, Request, Response, Uri,
};
use hyper_util::rt::TokioIo;
use rand::Rng;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio::net::UnixStream;

use crate::{
    config::CONTAINER_NAME,
    workload::{
        self, AddLayerSnafu, ApplyOutcome, Layer, PushFileSnafu, RenderLayerSnafu, ReplanSnafu,
        WorkloadDescriptor, WorkloadSupervisor,
    },
};

const SYSTEM_INFO_PATH: &str = "/v1/system-info";
const LAYERS_PATH: &str = "/v1/layers";
const SERVICES_PATH: &str = "/v1/services";
const FILES_PATH: &str = "/v1/files";

const FILE_PERMISSIONS: &str = "644";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to connect to the Pebble socket {socket:?}"))]
    Connect {
        source: std::io::Error,
        socket: PathBuf,
    },

    #[snafu(display("failed to perform the HTTP handshake with Pebble"))]
    Handshake { source: hyper::Error },

    #[snafu(display("failed to encode the request to {path}"))]
    EncodeRequest {
        source: serde_json::Error,
        path: &'static str,
    },

    #[snafu(display("invalid multipart content type"))]
    ContentType { source: InvalidHeaderValue },

    #[snafu(display("request to {path} failed"))]
    SendRequest {
        source: hyper::Error,
        path: &'static str,
    },

    #[snafu(display("Pebble answered {method} {path} with {status}"))]
    UnexpectedStatus {
        method: Method,
        path: &'static str,
        status: hyper::StatusCode,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize)]
struct AddLayerRequest<'a> {
    action: &'static str,
    combine: bool,
    label: &'a str,
    format: &'static str,
    layer: &'a str,
}

#[derive(Serialize)]
struct ServicesRequest {
    action: &'static str,
    services: Vec<String>,
}

#[derive(Serialize)]
struct WriteFilesRequest<'a> {
    action: &'static str,
    files: Vec<WriteFile<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct WriteFile<'a> {
    path: &'a str,
    make_dirs: bool,
    permissions: &'static str,
}

pub struct PebbleClient {
    socket: PathBuf,
}

impl PebbleClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Whether Pebble in the workload container is up and answering.
    pub async fn can_connect(&self) -> bool {
        match self
            .send(Method::GET, SYSTEM_INFO_PATH, None, String::new())
            .await
        {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(socket = ?self.socket, %error, "Pebble is not reachable");
                false
            }
        }
    }

    /// Merges `layer` into the layer labelled `label`, creating it if necessary.
    pub async fn add_layer(&self, label: &str, layer: &str) -> Result<()> {
        let body = serde_json::to_string(&AddLayerRequest {
            action: "add",
            combine: true,
            label,
            format: "yaml",
            layer,
        })
        .context(EncodeRequestSnafu { path: LAYERS_PATH })?;
        self.send(Method::POST, LAYERS_PATH, Some(json_content_type()), body)
            .await?;
        Ok(())
    }

    /// Restarts every service whose configuration changed and starts all enabled services.
    pub async fn replan(&self) -> Result<()> {
        let body = serde_json::to_string(&ServicesRequest {
            action: "replan",
            services: Vec::new(),
        })
        .context(EncodeRequestSnafu {
            path: SERVICES_PATH,
        })?;
        self.send(Method::POST, SERVICES_PATH, Some(json_content_type()), body)
            .await?;
        Ok(())
    }

    /// Writes `content` to `path` inside the container, creating parent directories.
    pub async fn push(&self, path: &str, content: &str) -> Result<()> {
        let request = serde_json::to_string(&WriteFilesRequest {
            action: "write",
            files: vec![WriteFile {
                path,
                make_dirs: true,
                permissions: FILE_PERMISSIONS,
            }],
        })
        .context(EncodeRequestSnafu { path: FILES_PATH })?;

        let boundary = multipart_boundary();
        let body = format!(
            "--{boundary}\r\n\
             Content-Type: application/json\r\n\
             Content-Disposition: form-data; name=\"request\"\r\n\
             \r\n\
             {request}\r\n\
             --{boundary}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: form-data; name=\"files\"; filename=\"{path}\"\r\n\
             \r\n\
             {content}\r\n\
             --{boundary}--\r\n"
        );
        let content_type =
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
                .context(ContentTypeSnafu)?;
        self.send(Method::POST, FILES_PATH, Some(content_type), body)
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &'static str,
        content_type: Option<HeaderValue>,
        body: String,
    ) -> Result<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|_| ConnectSnafu {
                socket: self.socket.clone(),
            })?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .context(HandshakeSnafu)?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%error, "Pebble connection closed with an error");
            }
        });

        let mut request = Request::new(body);
        *request.method_mut() = method.clone();
        *request.uri_mut() = Uri::from_static(path);
        let headers = request.headers_mut();
        headers.insert(header::HOST, HeaderValue::from_static("localhost"));
        if let Some(content_type) = content_type {
            headers.insert(header::CONTENT_TYPE, content_type);
        }

        let response = sender
            .send_request(request)
            .await
            .context(SendRequestSnafu { path })?;
        let status = response.status();
        if !status.is_success() {
            return UnexpectedStatusSnafu {
                method,
                path,
                status,
            }
            .fail();
        }
        Ok(response)
    }
}

fn json_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn multipart_boundary() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

/// Applies the workload as a Pebble layer inside the sidecar container.
pub struct PebbleSupervisor {
    client: PebbleClient,
}

impl PebbleSupervisor {
    pub fn new(client: PebbleClient) -> Self {
        Self { client }
    }
}

impl WorkloadSupervisor for PebbleSupervisor {
    fn applying_message(&self) -> &'static str {
        "Configuring Pebble layer"
    }

    async fn apply(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<ApplyOutcome, workload::Error> {
        if !self.client.can_connect().await {
            return Ok(ApplyOutcome::Deferred {
                reason: format!(
                    "Pebble socket {} of container {} is not reachable",
                    self.client.socket().display(),
                    descriptor.container
                ),
            });
        }

        for file in &descriptor.files {
            let path = file.path();
            self.client
                .push(&path, &file.content)
                .await
                .context(PushFileSnafu { path: &path })?;
        }

        let layer = serde_yaml::to_string(&Layer::from(descriptor)).context(RenderLayerSnafu)?;
        self.client
            .add_layer(CONTAINER_NAME, &layer)
            .await
            .context(AddLayerSnafu)?;
        self.client.replan().await.context(ReplanSnafu)?;
        Ok(ApplyOutcome::Applied)
    }
}
