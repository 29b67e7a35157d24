//! Topology discovery over the REST interface: one fetch, then a long-lived
//! streaming subscription.

use crate::core::{Result, TopologyError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Separator between documents on the streaming endpoint.
pub const STREAM_DELIMITER: &[u8] = b"\n\n\n\n";

#[async_trait]
pub trait HttpConfigSource: Send + Sync {
    /// One-shot fetch of the bucket topology document.
    async fn fetch(&self) -> Result<String>;

    /// Opens the streaming endpoint. The stream ends when the connection drops.
    async fn stream(&self) -> Result<BoxStream<'static, Result<String>>>;
}

/// Builds a fresh source for the current seed list.
pub trait HttpSourceFactory: Send + Sync {
    fn create(
        &self,
        seeds: &[String],
        bucket: &str,
        password: &str,
    ) -> Result<Arc<dyn HttpConfigSource>>;
}

/// `http://host:port` part of a seed such as `http://host:port/pools`.
pub fn seed_origin(seed: &str) -> Option<String> {
    let (scheme, rest) = seed.split_once("://").unwrap_or(("http", seed));
    let authority = rest.split('/').next().unwrap_or_default();
    (!authority.is_empty()).then(|| format!("{}://{}", scheme, authority))
}

/// Splits a chunked byte stream into delimited documents.
///
/// Blank documents are skipped. A document that is not valid UTF-8 is yielded
/// as a parse error and the stream carries on. A transport error ends the
/// stream after being yielded; a trailing partial document is dropped.
pub fn split_config_stream<S, B, E>(chunks: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<TopologyError> + Send + 'static,
{
    let chunks = Box::pin(chunks);
    stream::unfold(
        (chunks, Vec::<u8>::new(), false),
        |(mut chunks, mut buffer, mut done)| async move {
            loop {
                if let Some(position) = find_delimiter(&buffer) {
                    let document: Vec<u8> = buffer.drain(..position).collect();
                    buffer.drain(..STREAM_DELIMITER.len());
                    let document = match String::from_utf8(document) {
                        Ok(document) => document.trim().to_string(),
                        Err(err) => {
                            let err = TopologyError::Parse(format!(
                                "streamed document is not valid UTF-8: {}",
                                err.utf8_error()
                            ));
                            return Some((Err(err), (chunks, buffer, done)));
                        }
                    };
                    if document.is_empty() {
                        continue;
                    }
                    return Some((Ok(document), (chunks, buffer, done)));
                }
                if done {
                    return None;
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(err)) => {
                        done = true;
                        buffer.clear();
                        return Some((Err(err.into()), (chunks, buffer, done)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(STREAM_DELIMITER.len())
        .position(|window| window == STREAM_DELIMITER)
}

/// reqwest-backed source speaking the cluster's REST paths.
pub struct ReqwestConfigSource {
    client: Client,
    origins: Vec<String>,
    bucket: String,
    password: String,
    operation_timeout: Duration,
}

impl ReqwestConfigSource {
    fn request(&self, origin: &str, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", origin, path));
        if self.password.is_empty() {
            request
        } else {
            request.basic_auth(&self.bucket, Some(&self.password))
        }
    }

    fn bucket_path(&self) -> String {
        format!("/pools/default/buckets/{}", self.bucket)
    }

    fn streaming_path(&self) -> String {
        format!("/pools/default/bucketsStreaming/{}", self.bucket)
    }
}

#[async_trait]
impl HttpConfigSource for ReqwestConfigSource {
    async fn fetch(&self) -> Result<String> {
        let mut last_error = TopologyError::Transport("no HTTP seeds configured".to_string());
        for origin in &self.origins {
            let response = self
                .request(origin, &self.bucket_path())
                .timeout(self.operation_timeout)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match response {
                Ok(response) => match response.text().await {
                    Ok(body) => return Ok(body),
                    Err(err) => last_error = err.into(),
                },
                Err(err) => {
                    log::debug!("fetching topology from {} failed: {}", origin, err);
                    last_error = err.into();
                }
            }
        }
        Err(last_error)
    }

    async fn stream(&self) -> Result<BoxStream<'static, Result<String>>> {
        let mut last_error = TopologyError::Transport("no HTTP seeds configured".to_string());
        for origin in &self.origins {
            let response = self
                .request(origin, &self.streaming_path())
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match response {
                Ok(response) => return Ok(split_config_stream(response.bytes_stream())),
                Err(err) => {
                    log::debug!("opening topology stream on {} failed: {}", origin, err);
                    last_error = err.into();
                }
            }
        }
        Err(last_error)
    }
}

/// Factory for [`ReqwestConfigSource`]s sharing one connection pool.
#[derive(Clone)]
pub struct ReqwestSourceFactory {
    client: Client,
    operation_timeout: Duration,
}

impl ReqwestSourceFactory {
    pub fn new(connect_timeout: Duration, operation_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            operation_timeout,
        })
    }
}

impl HttpSourceFactory for ReqwestSourceFactory {
    fn create(
        &self,
        seeds: &[String],
        bucket: &str,
        password: &str,
    ) -> Result<Arc<dyn HttpConfigSource>> {
        let origins: Vec<String> = seeds.iter().filter_map(|seed| seed_origin(seed)).collect();
        if origins.is_empty() {
            return Err(TopologyError::Configuration(
                "no usable HTTP seed".to_string(),
            ));
        }
        Ok(Arc::new(ReqwestConfigSource {
            client: self.client.clone(),
            origins,
            bucket: bucket.to_string(),
            password: password.to_string(),
            operation_timeout: self.operation_timeout,
        }))
    }
}

/// An installed HTTP channel: its source and the task draining the stream.
pub struct HttpSession {
    source: Arc<dyn HttpConfigSource>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HttpSession {
    pub fn new(source: Arc<dyn HttpConfigSource>) -> Self {
        Self {
            source,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Arc<dyn HttpConfigSource> {
        &self.source
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_closed() {
            handle.abort();
            return;
        }
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the stream task. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: Vec<&'static str>) -> impl Stream<Item = Result<&'static [u8]>> {
        stream::iter(parts.into_iter().map(|part| Ok(part.as_bytes())))
    }

    #[tokio::test]
    async fn test_split_across_chunk_boundaries() {
        let docs: Vec<_> = split_config_stream(chunks(vec![
            "{\"rev\":1}\n\n",
            "\n\n{\"rev\"",
            ":2}\n\n\n\n\n\n\n\n{\"rev\":3}",
        ]))
        .collect()
        .await;
        let docs: Vec<String> = docs.into_iter().map(|doc| doc.unwrap()).collect();
        assert_eq!(docs, vec!["{\"rev\":1}".to_string(), "{\"rev\":2}".to_string()]);
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let source = stream::iter(vec![
            Ok(b"{}\n\n\n\n".to_vec()),
            Err(TopologyError::Transport("reset".to_string())),
            Ok(b"{}\n\n\n\n".to_vec()),
        ]);
        let items: Vec<_> = split_config_stream(source).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(TopologyError::Transport(_))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_document_is_rejected_without_ending_stream() {
        let mut corrupted = b"{\"nodes\":[{\"hostname\":\"10.0.0.".to_vec();
        corrupted.push(0xff);
        corrupted.extend_from_slice(b":8091\"}]}\n\n\n\n{\"rev\":2}\n\n\n\n");
        let source = stream::iter(vec![Ok::<_, TopologyError>(corrupted)]);

        let items: Vec<_> = split_config_stream(source).collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(TopologyError::Parse(_))));
        assert_eq!(items[1].as_deref(), Ok("{\"rev\":2}"));
    }

    #[test]
    fn test_seed_origin() {
        assert_eq!(
            seed_origin("http://10.0.0.1:8091/pools").as_deref(),
            Some("http://10.0.0.1:8091")
        );
        assert_eq!(seed_origin("node:8091").as_deref(), Some("http://node:8091"));
        assert_eq!(seed_origin("http:///pools"), None);
    }

    #[test]
    fn test_factory_rejects_empty_seeds() {
        let factory =
            ReqwestSourceFactory::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        assert!(factory.create(&[], "default", "").is_err());
    }
}
