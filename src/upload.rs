//! File uploads following the GraphQL multipart request convention.
//!
//! Inbound requests carry `operations`, then `map`, then one part per file.
//! Every file except the last is spooled to an anonymous temporary file so
//! the parser can move on; the last one is streamed straight through a
//! bounded channel. Each upload body can be taken exactly once, when it is
//! forwarded to the subgraph that declares the mapped variable.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, io,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use multer::{Field, Multipart};
use reqwest::multipart::{Form, Part};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

use crate::{config::UploadConfig, error::UploadError};

const CHANNEL_CAPACITY: usize = 4;

pub type UploadBody = BoxStream<'static, io::Result<Bytes>>;

pub struct Upload {
    key: String,
    /// Variable paths the file is bound to, without the `variables.` prefix.
    targets: Vec<Vec<String>>,
    file_name: Option<String>,
    content_type: Option<String>,
    body: Mutex<Option<UploadBody>>,
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("key", &self.key)
            .field("targets", &self.targets)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl Upload {
    pub fn new(
        key: impl Into<String>,
        targets: Vec<Vec<String>>,
        file_name: Option<String>,
        content_type: Option<String>,
        body: UploadBody,
    ) -> Self {
        Upload {
            key: key.into(),
            targets,
            file_name,
            content_type,
            body: Mutex::new(Some(body)),
        }
    }

    /// An upload whose whole content is already in memory.
    pub fn from_bytes(
        key: impl Into<String>,
        targets: Vec<Vec<String>>,
        file_name: Option<String>,
        content_type: Option<String>,
        content: Bytes,
    ) -> Self {
        let body = stream::once(async move { Ok(content) }).boxed();
        Self::new(key, targets, file_name, content_type, body)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn targets(&self) -> &[Vec<String>] {
        &self.targets
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Whether any target is bound to one of `variables`.
    pub fn is_used_by(&self, variables: &BTreeSet<String>) -> bool {
        self.targets
            .iter()
            .any(|target| target.first().is_some_and(|name| variables.contains(name)))
    }

    /// Hands out the body. Returns `None` once it has been taken.
    pub fn take_body(&self) -> Option<UploadBody> {
        self.body.lock().ok().and_then(|mut body| body.take())
    }
}

/// A parsed multipart request: the JSON `operations` part plus its files.
#[derive(Debug)]
pub struct MultipartOperation {
    pub operations: Value,
    pub uploads: Vec<Arc<Upload>>,
}

pub async fn read_multipart<S, O, E>(
    body: S,
    boundary: &str,
    limits: &UploadConfig,
) -> Result<MultipartOperation, UploadError>
where
    S: Stream<Item = Result<O, E>> + Send + 'static,
    O: Into<Bytes> + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let mut multipart = Multipart::new(body, boundary.to_string());

    let operations = read_json_field(&mut multipart, "operations").await?;
    let map = read_json_field(&mut multipart, "map").await?;
    let map: BTreeMap<String, Vec<String>> =
        serde_json::from_value(map).map_err(|e| UploadError::InvalidField {
            field: "map",
            reason: e.to_string(),
        })?;

    if map.len() > limits.max_files {
        return Err(UploadError::TooManyFiles(limits.max_files));
    }

    let mut pending = map
        .into_iter()
        .map(|(key, paths)| {
            let targets = paths
                .iter()
                .map(|path| variable_path(path))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((key, targets))
        })
        .collect::<Result<BTreeMap<_, _>, UploadError>>()?;

    let mut uploads = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let Some(mut field) = multipart.next_field().await? else {
            let missing: Vec<_> = pending.keys().cloned().collect();
            return Err(UploadError::InvalidField {
                field: "map",
                reason: format!("no file part was sent for {missing:?}"),
            });
        };

        let Some(targets) = field.name().and_then(|name| pending.remove(name)) else {
            continue;
        };

        let key = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(ToString::to_string);

        let body = if pending.is_empty() {
            tracing::debug!(upload = %key, "streaming last upload");
            stream_live(field, key.clone(), limits.max_file_size)
        } else {
            spool(&mut field, &key, limits.max_file_size).await?
        };

        uploads.push(Arc::new(Upload::new(key, targets, file_name, content_type, body)));
    }

    Ok(MultipartOperation { operations, uploads })
}

async fn read_json_field(
    multipart: &mut Multipart<'static>,
    name: &'static str,
) -> Result<Value, UploadError> {
    let field = multipart.next_field().await?.ok_or(UploadError::MissingField(name))?;

    if field.name() != Some(name) {
        return Err(UploadError::MissingField(name));
    }

    let text = field.text().await?;
    serde_json::from_str(&text).map_err(|e| UploadError::InvalidField {
        field: name,
        reason: e.to_string(),
    })
}

/// `variables.files.0` becomes `["files", "0"]`.
fn variable_path(path: &str) -> Result<Vec<String>, UploadError> {
    match path.split('.').collect::<Vec<_>>().as_slice() {
        ["variables", rest @ ..] if !rest.is_empty() => {
            Ok(rest.iter().map(|segment| segment.to_string()).collect())
        }
        _ => Err(UploadError::InvalidField {
            field: "map",
            reason: format!("`{path}` does not point into the operation variables"),
        }),
    }
}

async fn spool(
    field: &mut Field<'static>,
    key: &str,
    max_size: u64,
) -> Result<UploadBody, UploadError> {
    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut written = 0u64;

    while let Some(chunk) = field.chunk().await? {
        written += chunk.len() as u64;
        if written > max_size {
            return Err(UploadError::FileTooLarge(key.to_string(), max_size));
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    file.rewind().await?;

    tracing::debug!(upload = %key, bytes = written, "spooled upload");
    Ok(ReaderStream::new(file).boxed())
}

fn stream_live(field: Field<'static>, key: String, max_size: u64) -> UploadBody {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut field = field;
        let mut received = 0u64;

        while let Some(chunk) = field.next().await {
            let item = match chunk {
                Ok(bytes) => {
                    received += bytes.len() as u64;
                    if received > max_size {
                        Err(io::Error::other(UploadError::FileTooLarge(key.clone(), max_size)))
                    } else {
                        Ok(bytes)
                    }
                }
                Err(e) => Err(io::Error::other(e)),
            };

            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    ReceiverStream::new(rx).boxed()
}

/// Builds the multipart body for one subgraph request, taking the bodies of
/// the uploads bound to `used_variables`.
pub fn forward_form(
    query: &str,
    variables: &Map<String, Value>,
    uploads: &[Arc<Upload>],
    used_variables: &BTreeSet<String>,
) -> Result<Form, UploadError> {
    let operations = json!({ "query": query, "variables": variables });
    let mut map = Map::new();
    let mut parts = Vec::new();

    for upload in uploads.iter().filter(|upload| upload.is_used_by(used_variables)) {
        let body = upload
            .take_body()
            .ok_or_else(|| UploadError::AlreadyForwarded(upload.key.clone()))?;

        let key = parts.len().to_string();
        let paths: Vec<Value> = upload
            .targets
            .iter()
            .filter(|target| target.first().is_some_and(|name| used_variables.contains(name)))
            .map(|target| Value::String(format!("variables.{}", target.join("."))))
            .collect();
        map.insert(key.clone(), Value::Array(paths));

        let mut part = Part::stream(reqwest::Body::wrap_stream(body));
        if let Some(file_name) = &upload.file_name {
            part = part.file_name(file_name.clone());
        }
        if let Some(content_type) = &upload.content_type {
            part = part.mime_str(content_type).map_err(|e| UploadError::InvalidField {
                field: "content-type",
                reason: e.to_string(),
            })?;
        }
        parts.push((key, part));
    }

    let form = Form::new()
        .text("operations", operations.to_string())
        .text("map", Value::Object(map).to_string());

    Ok(parts.into_iter().fold(form, |form, (key, part)| form.part(key, part)))
}
