//! WebSocket connector for the hosted live voice service.

use crate::config::ServiceConfig;
use crate::error::{LiveError, Result};
use crate::transport::{VoiceChannel, VoiceConnector};
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Connects over `wss://` using the endpoint and API key from [`ServiceConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait::async_trait]
impl VoiceConnector for WebSocketConnector {
    async fn connect(&self, config: &ServiceConfig) -> Result<VoiceChannel> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!(
                var = %config.api_key_env,
                "no API key in environment, connecting without one"
            );
        }
        let url = endpoint_url(config, api_key.as_deref())?;
        info!(host = url.host_str().unwrap_or("<none>"), "opening websocket");

        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| LiveError::Transport(format!("websocket connect failed: {e}")))?;
        debug!(status = %response.status(), "websocket upgraded");

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| LiveError::Transport(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, LiveError>(Message::Text(text))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(e) => {
                            warn!("dropping non-UTF-8 binary message: {e}");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(e) => Some(Err(LiveError::Transport(e.to_string()))),
                })
            });

        Ok(VoiceChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// The service endpoint with the API key attached as the `key` query parameter.
///
/// # Errors
///
/// Returns [`LiveError::Config`] if the configured URL is not a `ws`/`wss` URL.
pub fn endpoint_url(config: &ServiceConfig, api_key: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(&config.url)
        .map_err(|e| LiveError::Config(format!("invalid service.url: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(LiveError::Config(format!(
            "service.url must use ws:// or wss://, got {}://",
            url.scheme()
        )));
    }
    if let Some(key) = api_key {
        url.query_pairs_mut().append_pair("key", key);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn key_is_appended_as_query_parameter() {
        let config = ServiceConfig::default();
        let url = endpoint_url(&config, Some("abc 123")).unwrap();
        assert_eq!(url.scheme(), "wss");
        let key = url
            .query_pairs()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned());
        assert_eq!(key.as_deref(), Some("abc 123"));
    }

    #[test]
    fn existing_query_is_preserved() {
        let config = ServiceConfig {
            url: "wss://example.test/live?alt=json".into(),
            ..ServiceConfig::default()
        };
        let url = endpoint_url(&config, Some("k")).unwrap();
        assert_eq!(url.query(), Some("alt=json&key=k"));
    }

    #[test]
    fn missing_key_leaves_url_untouched() {
        let config = ServiceConfig::default();
        let url = endpoint_url(&config, None).unwrap();
        assert!(url.query().is_none());
    }

    #[test]
    fn non_websocket_scheme_is_rejected() {
        let config = ServiceConfig {
            url: "https://example.test/live".into(),
            ..ServiceConfig::default()
        };
        assert!(matches!(endpoint_url(&config, None), Err(LiveError::Config(_))));
    }
}
