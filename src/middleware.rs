use axum::{
    extract::{FromRequestParts, MatchedPath},
    http::{request::Parts, HeaderMap, Request},
};
use data_model::{AgentReport, EndpointType, UpdateScheduleId};
use tower_http::trace::MakeSpan;
use tracing::Span;

use crate::http_objects::EdgeAPIError;

pub const EDGE_ID_HEADER: &str = "x-edge-id";
pub const EDGE_PLATFORM_HEADER: &str = "x-edge-agent-platform";
pub const EDGE_VERSION_HEADER: &str = "x-edge-agent-version";
pub const EDGE_TIMEZONE_HEADER: &str = "x-edge-timezone";
pub const EDGE_UPDATE_ID_HEADER: &str = "x-edge-update-id";

#[derive(Clone)]
pub struct InstanceRequestSpan {
    env: String,
    instance_id: String,
}

impl InstanceRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for InstanceRequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let matched_path = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched_path| matched_path.as_str());
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %request.method(),
            matched_path,
            edge_id = request
                .headers()
                .get(EDGE_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
        )
    }
}

/// Agent identity and metadata carried by request headers.
#[derive(Debug, Clone, Default)]
pub struct EdgeHeaders {
    pub edge_id: Option<String>,
    pub agent: AgentReport,
    pub update_id: Option<UpdateScheduleId>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl EdgeHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, EdgeAPIError> {
        let platform = match header_str(headers, EDGE_PLATFORM_HEADER) {
            Some(raw) => {
                let platform = raw
                    .parse::<u8>()
                    .ok()
                    .and_then(EndpointType::from_platform)
                    .ok_or_else(|| {
                        EdgeAPIError::bad_request(&format!("invalid agent platform {}", raw))
                    })?;
                Some(platform)
            }
            None => None,
        };
        let update_id = match header_str(headers, EDGE_UPDATE_ID_HEADER) {
            Some(raw) => Some(UpdateScheduleId::new(raw.parse::<u64>().map_err(|_| {
                EdgeAPIError::bad_request(&format!("invalid update id {}", raw))
            })?)),
            None => None,
        };
        Ok(Self {
            edge_id: header_str(headers, EDGE_ID_HEADER).map(str::to_string),
            agent: AgentReport {
                version: header_str(headers, EDGE_VERSION_HEADER).map(str::to_string),
                platform,
                time_zone: header_str(headers, EDGE_TIMEZONE_HEADER).map(str::to_string),
            },
            update_id,
        })
    }

    pub fn require_edge_id(&self) -> Result<&str, EdgeAPIError> {
        self.edge_id
            .as_deref()
            .ok_or_else(|| EdgeAPIError::forbidden("missing X-Edge-Id header"))
    }
}

impl<S> FromRequestParts<S> for EdgeHeaders
where
    S: Send + Sync,
{
    type Rejection = EdgeAPIError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_edge_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Edge-Id", HeaderValue::from_static("edge-1"));
        headers.insert("X-Edge-Agent-Platform", HeaderValue::from_static("2"));
        headers.insert("X-Edge-Agent-Version", HeaderValue::from_static("2.19.0"));
        headers.insert("X-Edge-Timezone", HeaderValue::from_static("Europe/Paris"));
        headers.insert("X-Edge-Update-Id", HeaderValue::from_static("7"));

        let parsed = EdgeHeaders::from_headers(&headers).unwrap();
        assert_eq!(parsed.require_edge_id().unwrap(), "edge-1");
        assert_eq!(parsed.agent.platform, Some(EndpointType::EdgeAgentOnKubernetes));
        assert_eq!(parsed.agent.version.as_deref(), Some("2.19.0"));
        assert_eq!(parsed.agent.time_zone.as_deref(), Some("Europe/Paris"));
        assert_eq!(parsed.update_id, Some(UpdateScheduleId::new(7)));
    }

    #[test]
    fn test_edge_headers_rejects_bad_values() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Edge-Agent-Platform", HeaderValue::from_static("9"));
        assert!(EdgeHeaders::from_headers(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("X-Edge-Update-Id", HeaderValue::from_static("latest"));
        assert!(EdgeHeaders::from_headers(&headers).is_err());

        let parsed = EdgeHeaders::from_headers(&HeaderMap::new()).unwrap();
        assert!(parsed.require_edge_id().is_err());
    }
}
