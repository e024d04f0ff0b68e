use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

/// Direct API root used by packaged shells and direct-routed deployments
pub const DEFAULT_DIRECT_API_ROOT: &str = "https://saidawifi.com/api";

/// Base path of the same-origin proxy
pub const PROXY_BASE_ADDRESS: &str = "/api";

/// Schemes that mean "served over the network". Anything else is a packaged
/// native shell loading bundled assets.
const NETWORK_SCHEMES: &[&str] = &["http", "https"];

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum RoutingMode {
    /// Call the API root directly
    Direct,
    /// Go through the serving origin's `/api` proxy
    Proxied,
}

impl RoutingMode {
    /// Routing for public and external deployments. Fixed at build time by
    /// the `proxy-external` feature, never inferred from the runtime.
    pub const fn external_default() -> Self {
        if cfg!(feature = "proxy-external") {
            RoutingMode::Proxied
        } else {
            RoutingMode::Direct
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum DeploymentKind {
    NativeShell,
    LocalDevelopment,
    HostedPreview,
    Production,
    External,
}

/// Immutable facts about where the portal is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    origin: Url,
}

impl RuntimeContext {
    pub fn new(origin: Url) -> Self {
        Self { origin }
    }

    pub fn from_origin(origin: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(origin)?))
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn scheme(&self) -> &str {
        self.origin.scheme()
    }

    pub fn host(&self) -> &str {
        self.origin.host_str().unwrap_or_default()
    }
}

/// Deployment configuration the router consults. Everything here is static
/// for a build or install; none of it is probed at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub direct_api_root: String,
    /// Hosted-preview domains; a host matches when equal to or a subdomain of one
    pub hosted_preview_suffixes: Vec<String>,
    pub production_hosts: Vec<String>,
    #[serde(skip, default = "RoutingMode::external_default")]
    pub external_mode: RoutingMode,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            direct_api_root: DEFAULT_DIRECT_API_ROOT.to_string(),
            hosted_preview_suffixes: vec!["replit.dev".to_string(), "replit.app".to_string()],
            production_hosts: vec![
                "saidawifi.com".to_string(),
                "108.181.215.206".to_string(),
                "104.248.210.61".to_string(),
            ],
            external_mode: RoutingMode::external_default(),
        }
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}

impl RoutingPolicy {
    pub fn is_hosted_preview(&self, host: &str) -> bool {
        self.hosted_preview_suffixes
            .iter()
            .any(|suffix| host_matches(host, suffix))
    }

    pub fn is_production(&self, host: &str) -> bool {
        self.production_hosts.iter().any(|h| host_matches(host, h))
    }
}

/// The routing decision for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub routing_mode: RoutingMode,
    /// Absolute API root for direct routing, `/api` for proxied routing
    pub base_address: String,
    pub deployment: DeploymentKind,
    pub origin: Url,
    /// Preview domains whose cookies share this origin's scope
    pub related_domains: Vec<String>,
}

impl EnvironmentDescriptor {
    /// Derive the descriptor from runtime facts. Total: every input maps to
    /// a descriptor.
    pub fn detect(ctx: &RuntimeContext, policy: &RoutingPolicy) -> Self {
        let host = ctx.host().to_ascii_lowercase();
        let is_network = NETWORK_SCHEMES.contains(&ctx.scheme());

        let (deployment, routing_mode) = if !is_network {
            (DeploymentKind::NativeShell, RoutingMode::Direct)
        } else if LOOPBACK_HOSTS.contains(&host.as_str()) {
            (DeploymentKind::LocalDevelopment, RoutingMode::Proxied)
        } else if policy.is_hosted_preview(&host) {
            (DeploymentKind::HostedPreview, RoutingMode::Proxied)
        } else if policy.is_production(&host) {
            (DeploymentKind::Production, policy.external_mode)
        } else {
            (DeploymentKind::External, policy.external_mode)
        };

        let base_address = match routing_mode {
            RoutingMode::Direct => policy.direct_api_root.trim_end_matches('/').to_string(),
            RoutingMode::Proxied => PROXY_BASE_ADDRESS.to_string(),
        };

        let related_domains = policy
            .hosted_preview_suffixes
            .iter()
            .filter(|suffix| host_matches(&host, suffix))
            .map(|suffix| suffix.trim_start_matches('.').to_string())
            .collect();

        Self {
            routing_mode,
            base_address,
            deployment,
            origin: ctx.origin().clone(),
            related_domains,
        }
    }

    /// Full URL for an API path such as `/identity`
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        match Url::parse(&self.base_address) {
            Ok(_) => Url::parse(&format!("{}{}", self.base_address, path)),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.origin.join(&format!("{}{}", self.base_address, path))
            }
            Err(e) => Err(e),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.origin.host_str()
    }

    /// Deployments reachable by the public, i.e. anything but a developer's
    /// loopback server.
    pub fn is_public_deployment(&self) -> bool {
        self.deployment != DeploymentKind::LocalDevelopment
    }
}

/// Computes the [`EnvironmentDescriptor`] once and hands out the same value
/// for the rest of the process. Switching routing under a live credential
/// would change which endpoints exist, so there is no way to recompute.
pub struct EnvironmentRouter {
    context: RuntimeContext,
    policy: RoutingPolicy,
    descriptor: OnceLock<Arc<EnvironmentDescriptor>>,
}

impl EnvironmentRouter {
    pub fn new(context: RuntimeContext, policy: RoutingPolicy) -> Self {
        Self {
            context,
            policy,
            descriptor: OnceLock::new(),
        }
    }

    pub fn descriptor(&self) -> Arc<EnvironmentDescriptor> {
        self.descriptor
            .get_or_init(|| {
                let descriptor = EnvironmentDescriptor::detect(&self.context, &self.policy);
                info!(
                    scheme = self.context.scheme(),
                    host = self.context.host(),
                    deployment = ?descriptor.deployment,
                    routing = ?descriptor.routing_mode,
                    base = %descriptor.base_address,
                    "Environment detected"
                );
                Arc::new(descriptor)
            })
            .clone()
    }
}
