use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{BuildEventStream, BuilderMode, ImageBuilder, sse};
use crate::docker::RegistryClient;
use crate::error::CoreError;
use crate::validate::BuildSpec;

/// Hands builds to a BinderHub instance and relays its event stream.
#[derive(Debug, Clone)]
pub struct DelegatedBuilder {
    client: reqwest::Client,
    base_url: reqwest::Url,
    token: Option<String>,
    registry: Option<RegistryClient>,
}

impl DelegatedBuilder {
    /// `registry` is only used for image removal; pass `None` when the
    /// build service owns its own image store.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        registry: Option<RegistryClient>,
    ) -> Result<Self, CoreError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| CoreError::Delegated(format!("invalid build service url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(CoreError::Delegated(format!(
                "build service url {base_url} cannot carry a path"
            )));
        }
        // No overall timeout: a build stream stays open as long as the build runs.
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            token,
            registry,
        })
    }

    /// `<base>/build/<provider>/<url-encoded repo>/<ref>?build_only=true`
    pub fn build_url(&self, provider: &str, repo: &str, git_ref: &str) -> Result<reqwest::Url, CoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CoreError::Delegated("build service url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["build", provider, repo, git_ref]);
        url.query_pairs_mut().append_pair("build_only", "true");
        Ok(url)
    }
}

#[async_trait]
impl ImageBuilder for DelegatedBuilder {
    fn mode(&self) -> BuilderMode {
        BuilderMode::Delegated
    }

    async fn build(&self, uid: Uuid, spec: &BuildSpec) -> Result<BuildEventStream, CoreError> {
        let provider = spec
            .provider
            .as_deref()
            .ok_or_else(|| CoreError::Delegated("missing repository provider".into()))?;
        let url = self.build_url(provider, &spec.repo, spec.checkout_ref())?;
        info!(%uid, provider, repo = %spec.repo, "requesting delegated build");

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(sse::decode_events(response.bytes_stream()))
    }

    async fn remove_image(&self, name: &str) -> Result<bool, CoreError> {
        let Some(registry) = &self.registry else {
            return Ok(false);
        };
        match registry.remove_image(name).await {
            // Images built by the delegated service may live on another host.
            Err(CoreError::RuntimeUnavailable(e)) => {
                warn!(image = name, error = %e, "local runtime unavailable; skipping image removal");
                Ok(false)
            }
            other => other,
        }
    }
}
