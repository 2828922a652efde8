use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use snafu::{ResultExt, ensure};

use crate::backend::{
    BackendConfig, BackendResult, BoxFuture, BuildClientSnafu, ByteStream, ChatBackend,
    DecodeResponseSnafu, MissingBodySnafu, MissingEndpointSnafu, StatusSnafu, TransportSnafu,
};
use crate::wire::{ChatRequest, ChatResponse, HistoryQuery, HistoryResponse};

pub const HTTP_BACKEND_ID: &str = "http";

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// [`ChatBackend`] speaking JSON over HTTP with a `text/event-stream` streaming endpoint.
pub struct HttpChatBackend {
    config: BackendConfig,
    client: Client,
}

impl HttpChatBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-backend-new",
                endpoint: config.endpoint.clone(),
            }
        );

        // Only the connect phase gets a client-wide timeout; a total timeout would cut long streams.
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    async fn ensure_success(response: Response, stage: &'static str) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), stage, "backend returned non-success status");
        StatusSnafu {
            stage,
            status: status.as_u16(),
            body,
        }
        .fail()
    }
}

impl ChatBackend for HttpChatBackend {
    fn id(&self) -> &str {
        HTTP_BACKEND_ID
    }

    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ByteStream>> {
        Box::pin(async move {
            let response = self
                .authorized(self.client.post(self.url("chat/stream")))
                .header(ACCEPT, EVENT_STREAM_MIME)
                .json(request)
                .send()
                .await
                .context(TransportSnafu {
                    stage: "open-stream",
                })?;
            let response = Self::ensure_success(response, "open-stream-status").await?;

            ensure!(
                response.status() != StatusCode::NO_CONTENT && response.content_length() != Some(0),
                MissingBodySnafu {
                    stage: "open-stream-body",
                }
            );

            tracing::debug!(
                capture_id = %request.capture_id,
                message_count = request.messages.len(),
                "backend stream opened"
            );

            let stream = response.bytes_stream().map(|chunk| {
                chunk.context(TransportSnafu {
                    stage: "read-stream-chunk",
                })
            });
            Ok(Box::pin(stream) as ByteStream)
        })
    }

    fn complete<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, BackendResult<ChatResponse>> {
        Box::pin(async move {
            let response = self
                .authorized(self.client.post(self.url("chat")))
                .timeout(self.config.request_timeout)
                .json(request)
                .send()
                .await
                .context(TransportSnafu { stage: "complete" })?;
            let response = Self::ensure_success(response, "complete-status").await?;

            response.json::<ChatResponse>().await.context(DecodeResponseSnafu {
                stage: "decode-completion",
            })
        })
    }

    fn history<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> BoxFuture<'a, BackendResult<HistoryResponse>> {
        Box::pin(async move {
            let mut params = Vec::new();
            if let Some(limit) = query.limit {
                params.push(("limit", limit.to_string()));
            }
            if let Some(offset) = query.offset {
                params.push(("offset", offset.to_string()));
            }

            let url = self.url(&format!("chat/history/{}", query.capture_id));
            let response = self
                .authorized(self.client.get(url))
                .timeout(self.config.request_timeout)
                .query(&params)
                .send()
                .await
                .context(TransportSnafu { stage: "history" })?;
            let response = Self::ensure_success(response, "history-status").await?;

            response.json::<HistoryResponse>().await.context(DecodeResponseSnafu {
                stage: "decode-history",
            })
        })
    }

    fn delete_history<'a>(&'a self, capture_id: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("chat/history/{capture_id}"));
            let response = self
                .authorized(self.client.delete(url))
                .timeout(self.config.request_timeout)
                .send()
                .await
                .context(TransportSnafu {
                    stage: "delete-history",
                })?;
            Self::ensure_success(response, "delete-history-status").await?;
            Ok(())
        })
    }
}
