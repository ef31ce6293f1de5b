use crate::config::{Config, Image, Registry, RegistryAuth};
use crate::error::{Error, Result};
use crate::secret_string::{SecretString, expand_env_vars};
use anyhow::Context;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tracing::{debug, info};

/// Endpoint used when a registry is configured with an empty name.
pub const DEFAULT_REGISTRY: &str = "https://registry-1.docker.io";

static MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
static DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
static CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the current content digest of an image tag.
pub trait DigestResolver {
    async fn resolve(&self, image: &Image, registry: &Registry) -> Result<String>;
}

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .timeout(config.registry_timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parses a challenge header. Only the `Bearer` scheme is accepted and `realm` is mandatory.
    pub fn parse(header: &str, registry: &str) -> Result<Self> {
        let header = header.trim();
        if header.is_empty() {
            return Err(Error::MalformedChallenge {
                registry: registry.to_string(),
                reason: "empty WWW-Authenticate header".to_string(),
            });
        }

        let (scheme, params) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::UnsupportedAuthScheme {
                registry: registry.to_string(),
                scheme: scheme.to_string(),
            });
        }

        let mut attributes = parse_attributes(params);
        let realm = attributes
            .remove("realm")
            .filter(|realm| !realm.is_empty())
            .ok_or_else(|| Error::MalformedChallenge {
                registry: registry.to_string(),
                reason: "challenge has no realm".to_string(),
            })?;

        Ok(AuthChallenge {
            realm,
            service: attributes.remove("service"),
            scope: attributes.remove("scope"),
        })
    }
}

/// Splits `key="value",key=value` pairs. Quoted values may contain commas and `\"` escapes.
fn parse_attributes(input: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            if chars.peek().is_none() {
                break;
            }
            // bare token without value
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }

        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            attributes.insert(key, value);
        }
    }

    attributes
}

fn normalize_registry(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_REGISTRY
    } else {
        name
    }
}

/// Docker Hub keeps official images under `library/`.
fn normalize_image_path(registry: &str, image: &str) -> String {
    if registry == DEFAULT_REGISTRY && !image.contains('/') {
        format!("library/{}", image)
    } else {
        image.to_string()
    }
}

/// Registry credentials with environment placeholders resolved.
struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    fn expand(auth: &RegistryAuth) -> Result<Option<Self>> {
        let username = expand_env_vars(&auth.username)?;
        if username.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credentials {
            username,
            password: auth.password.expand()?,
        }))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct Manifest {
    config: Option<Descriptor>,
}

#[derive(Deserialize)]
struct Descriptor {
    #[serde(default)]
    digest: String,
}

enum ManifestAuth<'a> {
    Anonymous,
    Basic(&'a Credentials),
    Bearer(&'a str),
}

/// Docker Registry HTTP API V2 client speaking anonymous, basic and bearer-token auth.
#[derive(Clone)]
pub struct RegistryClient {
    http_client: Client,
}

impl RegistryClient {
    pub fn new(http_client: Client) -> Self {
        RegistryClient { http_client }
    }

    async fn fetch_manifest(&self, url: &str, auth: ManifestAuth<'_>) -> Result<Response> {
        debug!("Fetching manifest from URL {}", url);
        let request = self
            .http_client
            .get(url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPE);
        let request = match auth {
            ManifestAuth::Anonymous => request,
            ManifestAuth::Basic(credentials) => request.basic_auth(
                &credentials.username,
                Some(credentials.password.expose_secret()),
            ),
            ManifestAuth::Bearer(token) => request.bearer_auth(token),
        };
        Ok(request.send().await?)
    }

    async fn fetch_token(
        &self,
        challenge: &AuthChallenge,
        image_path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image_path));
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }

        debug!(
            "Requesting bearer token from {} for scope {}",
            challenge.realm, scope
        );
        let mut request = self.http_client.get(&challenge.realm).query(&query);
        if let Some(credentials) = credentials {
            request = request.basic_auth(
                &credentials.username,
                Some(credentials.password.expose_secret()),
            );
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::TokenRequest {
                realm: challenge.realm.clone(),
                status,
            });
        }

        let body = response.text().await?;
        let missing_token = || Error::MissingToken {
            realm: challenge.realm.clone(),
        };
        let token_response: TokenResponse =
            serde_json::from_str(&body).map_err(|_| missing_token())?;
        token_response
            .token
            .filter(|token| !token.is_empty())
            .or(token_response.access_token.filter(|token| !token.is_empty()))
            .ok_or_else(missing_token)
    }
}

impl DigestResolver for RegistryClient {
    async fn resolve(&self, image: &Image, registry: &Registry) -> Result<String> {
        let registry_url = normalize_registry(&registry.name);
        let image_path = normalize_image_path(registry_url, &image.name);
        let credentials = match &registry.auth {
            Some(auth) => Credentials::expand(auth)?,
            None => None,
        };

        let url = format!(
            "{}/v2/{}/manifests/{}",
            registry_url.trim_end_matches('/'),
            image_path,
            image.tag
        );

        let first_attempt = match &credentials {
            Some(credentials) => ManifestAuth::Basic(credentials),
            None => ManifestAuth::Anonymous,
        };
        let mut response = self.fetch_manifest(&url, first_attempt).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .ok_or_else(|| Error::MalformedChallenge {
                    registry: registry_url.to_string(),
                    reason: "401 response without WWW-Authenticate header".to_string(),
                })?
                .to_str()
                .map_err(|_| Error::MalformedChallenge {
                    registry: registry_url.to_string(),
                    reason: "WWW-Authenticate header is not valid UTF-8".to_string(),
                })?;
            let challenge = AuthChallenge::parse(header, registry_url)?;
            let token = self
                .fetch_token(&challenge, &image_path, credentials.as_ref())
                .await?;
            response = self
                .fetch_manifest(&url, ManifestAuth::Bearer(&token))
                .await?;
        }

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RegistryRequest { url, status, body });
        }

        let digest = extract_digest(&url, response).await?;
        debug!("Registry reported digest {} for {}", digest, image.key());
        Ok(digest)
    }
}

/// Prefers the `Docker-Content-Digest` header, falls back to the manifest's config digest.
async fn extract_digest(url: &str, response: Response) -> Result<String> {
    let header_digest = response
        .headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|digest| !digest.is_empty())
        .map(str::to_owned);
    if let Some(digest) = header_digest {
        return Ok(digest);
    }

    let body = response.bytes().await?;
    let manifest: Manifest =
        serde_json::from_slice(&body).map_err(|source| Error::ManifestDecode {
            url: url.to_string(),
            source,
        })?;
    manifest
        .config
        .map(|config| config.digest)
        .filter(|digest| !digest.is_empty())
        .ok_or_else(|| Error::MissingDigest {
            url: url.to_string(),
        })
}
