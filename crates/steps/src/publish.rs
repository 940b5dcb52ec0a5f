//! Publishers: terminal steps delivering one kind to a destination
//!
//! Each publisher is configured with the `kind` it consumes, so one step
//! type serves every data kind and representation. Items are published
//! with [`Item::wire_body`]: representations keep their MIME type, plain
//! data goes out as JSON. `{id}` in a path or URL is replaced with the
//! item's identity.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use clusterfacts_core::prelude::*;
use clusterfacts_publish::{
    ChannelConfig, CloseOutcome, FileSink, HttpMethod, HttpSink, PublishChannel, RedisTransport,
    WriteMode, MAX_PUBLISH_ATTEMPTS,
};

fn expand_id(template: &str, item: &Item) -> String {
    template.replace("{id}", item.id())
}

fn body_of(item: &Item) -> Result<(String, String), StepError> {
    item.wire_body()
        .map_err(|e| StepError::failed(format!("cannot serialize {}: {e}", item.kind())))
}

#[derive(Debug, Deserialize)]
pub struct PublishFileParams {
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub mode: WriteMode,
}

/// Writes every received item to a file
pub struct PublishFile {
    kind: Kind,
    path: String,
    mode: WriteMode,
}

#[async_trait]
impl Step for PublishFile {
    const NAME: &'static str = "publish_file";
    type Params = PublishFileParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Write items of one kind to a file")
            .with_param(ParamSpec::required("kind", "Kind to publish"))
            .with_param(ParamSpec::required("path", "Target file, may contain {id}"))
            .with_param(ParamSpec::optional("mode", "replace (default) or append"))
    }

    fn new(params: PublishFileParams) -> Result<Self, StepError> {
        Ok(Self {
            kind: Kind::from(params.kind),
            path: params.path,
            mode: params.mode,
        })
    }

    fn requires(&self) -> Vec<Kind> {
        vec![self.kind.clone()]
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let mut written = 0;
        while let Received::Item(item) = ctx.receive(&self.kind).await {
            let (_, mut body) = body_of(&item)?;
            written += 1;
            if self.mode == WriteMode::Append {
                if body.is_empty() {
                    continue;
                }
                if !body.ends_with('\n') {
                    body.push('\n');
                }
            }
            let sink = FileSink::new(PathBuf::from(expand_id(&self.path, &item)), self.mode);
            sink.write(body.as_bytes())
                .map_err(|e| StepError::failed(e.to_string()))?;
        }

        if written == 0 {
            return Err(StepError::MissingInput(self.kind.clone()));
        }
        info!(kind = %self.kind, written, "Published to file");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct PublishHttpParams {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
}

/// Sends every received item to an HTTP endpoint
///
/// A failed send is retried once. Items that fail twice are logged and
/// counted but do not fail the step.
pub struct PublishHttp {
    kind: Kind,
    url: String,
    method: HttpMethod,
}

#[async_trait]
impl Step for PublishHttp {
    const NAME: &'static str = "publish_http";
    type Params = PublishHttpParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Send items of one kind to an HTTP endpoint")
            .with_param(ParamSpec::required("kind", "Kind to publish"))
            .with_param(ParamSpec::required("url", "Endpoint URL, may contain {id}"))
            .with_param(ParamSpec::optional("method", "PUT (default) or POST"))
            .with_timeout_hint(Duration::from_secs(60))
    }

    fn new(params: PublishHttpParams) -> Result<Self, StepError> {
        Ok(Self {
            kind: Kind::from(params.kind),
            url: params.url,
            method: params.method,
        })
    }

    fn requires(&self) -> Vec<Kind> {
        vec![self.kind.clone()]
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let sink = HttpSink::new(self.url.clone(), self.method);
        let (mut delivered, mut dropped) = (0usize, 0usize);
        while let Received::Item(item) = ctx.receive(&self.kind).await {
            let (mime, body) = body_of(&item)?;
            let url = expand_id(sink.url(), &item);
            if send_with_retry(&sink, &url, &mime, body.into_bytes()).await {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!(kind = %self.kind, delivered, dropped, "Some items were not published");
        } else {
            info!(kind = %self.kind, delivered, "Published over HTTP");
        }
        if delivered + dropped == 0 {
            return Err(StepError::MissingInput(self.kind.clone()));
        }
        Ok(())
    }
}

async fn send_with_retry(sink: &HttpSink, url: &str, mime: &str, body: Vec<u8>) -> bool {
    for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
        match sink.send_to(url, mime, body.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt < MAX_PUBLISH_ATTEMPTS => {
                warn!(%url, attempt, error = %e, "Send failed, retrying");
            }
            Err(e) => {
                error!(%url, attempts = MAX_PUBLISH_ATTEMPTS, error = %e, "Dropping item");
            }
        }
    }
    false
}

fn default_exchange() -> String {
    "clusterfacts".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PublishBusParams {
    pub kind: String,
    pub endpoints: Vec<String>,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    #[serde(default)]
    pub close_timeout_secs: Option<u64>,
}

/// Publishes every received item to a message bus exchange
///
/// The routing key is the item's identity. Items the channel gives up on
/// are logged and counted but do not fail the step.
pub struct PublishBus {
    kind: Kind,
    endpoints: Vec<String>,
    config: ChannelConfig,
    heartbeat: Option<Duration>,
}

#[async_trait]
impl Step for PublishBus {
    const NAME: &'static str = "publish_bus";
    type Params = PublishBusParams;

    fn spec() -> StepSpec {
        StepSpec::new(Self::NAME)
            .with_description("Publish items of one kind to a message bus exchange")
            .with_param(ParamSpec::required("kind", "Kind to publish"))
            .with_param(ParamSpec::required("endpoints", "Broker URLs"))
            .with_param(ParamSpec::optional("exchange", "Exchange name"))
            .with_param(ParamSpec::optional("heartbeat_secs", "Heartbeat interval"))
            .with_param(ParamSpec::optional("close_timeout_secs", "Bound on closing a connection"))
            .with_timeout_hint(Duration::from_secs(60))
    }

    fn new(params: PublishBusParams) -> Result<Self, StepError> {
        if params.endpoints.is_empty() {
            return Err(StepError::InvalidParams("endpoints must not be empty".to_string()));
        }
        let mut config = ChannelConfig::new(params.exchange);
        if let Some(secs) = params.close_timeout_secs {
            config = config.with_close_timeout(Duration::from_secs(secs));
        }
        let heartbeat = params.heartbeat_secs.map(Duration::from_secs);
        if let Some(interval) = heartbeat {
            config = config.with_heartbeat_interval(interval);
        }

        Ok(Self {
            kind: Kind::from(params.kind),
            endpoints: params.endpoints,
            config,
            heartbeat,
        })
    }

    fn requires(&self) -> Vec<Kind> {
        vec![self.kind.clone()]
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        let mut transport = RedisTransport::new();
        if let Some(interval) = self.heartbeat {
            transport = transport.with_heartbeat_interval(interval);
        }
        let mut channel =
            PublishChannel::new(transport, self.endpoints.clone(), self.config.clone())
                .map_err(|e| StepError::failed(e.to_string()))?;

        let mut delivered = 0u64;
        while let Received::Item(item) = channel.idle_until(ctx.receive(&self.kind)).await {
            let (_, body) = body_of(&item)?;
            if channel.publish(item.id(), body.as_bytes()).await.is_delivered() {
                delivered += 1;
            }
        }
        let dropped = channel.dropped();

        if let CloseOutcome::TimedOut = channel.close().await {
            warn!("Broker connection did not close in time");
        }

        if dropped > 0 {
            warn!(kind = %self.kind, delivered, dropped, "Some items were not published");
        } else {
            info!(kind = %self.kind, delivered, "Published to bus");
        }
        if delivered + dropped == 0 {
            return Err(StepError::MissingInput(self.kind.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publishers_require_their_kind() {
        let step = PublishFile::new(
            serde_json::from_value(json!({ "kind": "document.json", "path": "/tmp/{id}.json" }))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(Step::requires(&step), vec![Kind::new("document.json")]);
        assert!(PublishFile::spec().requires.is_empty());
    }

    #[test]
    fn test_expand_id() {
        let item = Item::new(crate::data::Document {
            name: "site".to_string(),
            fields: Default::default(),
        });
        assert_eq!(expand_id("/srv/facts/{id}.json", &item), "/srv/facts/site.json");
        assert_eq!(expand_id("http://h/facts", &item), "http://h/facts");
    }

    #[test]
    fn test_bus_needs_endpoints() {
        let params: PublishBusParams =
            serde_json::from_value(json!({ "kind": "document", "endpoints": [] })).unwrap();
        assert!(matches!(PublishBus::new(params), Err(StepError::InvalidParams(_))));
    }

    #[test]
    fn test_method_and_mode_params() {
        let params: PublishHttpParams =
            serde_json::from_value(json!({ "kind": "document", "url": "http://h", "method": "POST" }))
                .unwrap();
        assert_eq!(params.method, HttpMethod::Post);
        let params: PublishFileParams =
            serde_json::from_value(json!({ "kind": "document", "path": "/tmp/x" })).unwrap();
        assert_eq!(params.mode, WriteMode::Replace);
    }
}
