use crate::registry::DEFAULT_REGISTRY;
use crate::secret_string::{SecretString, expand_env_vars};
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};

const ENV_PREFIX: &str = "KUBE_DIGEST_SYNC_";
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WEBSERVER_PORT: u16 = 8080;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(
        default = "default_check_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub check_interval: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(
        default = "default_registry_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub registry_timeout: Duration,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub deployments: Vec<DeploymentTarget>,
}

/// A registry endpoint. An empty `name` stands for Docker Hub.
#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub name: String,
    pub auth: Option<RegistryAuth>,
}

/// Credentials may contain `${VAR}` placeholders; they are expanded when a request is made.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentTarget {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    #[serde(default = "default_webserver_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Default for Webserver {
    fn default() -> Self {
        Webserver {
            port: DEFAULT_WEBSERVER_PORT,
        }
    }
}

impl Image {
    /// Tracker identity: `registry/name:tag`.
    pub fn key(&self) -> String {
        format!("{}/{}:{}", self.registry, self.name, self.tag)
    }

    /// Prefix matched against `DeploymentTarget::image`. Non-default registries are
    /// qualified with their host, Docker Hub images are matched by bare name.
    pub fn deployment_prefix(&self) -> String {
        if self.registry.is_empty() || self.registry == DEFAULT_REGISTRY {
            return self.name.clone();
        }
        let host = self
            .registry
            .strip_prefix("https://")
            .or_else(|| self.registry.strip_prefix("http://"))
            .unwrap_or(&self.registry);
        format!("{}/{}", host, self.name)
    }
}

impl Config {
    pub fn find_registry(&self, name: &str) -> Option<&Registry> {
        self.registries.iter().find(|registry| registry.name == name)
    }

    /// Deployments whose configured image starts with the image's matching prefix.
    pub fn deployments_for<'a>(
        &'a self,
        image: &Image,
    ) -> impl Iterator<Item = &'a DeploymentTarget> + use<'a> {
        let prefix = image.deployment_prefix();
        self.deployments
            .iter()
            .filter(move |deployment| deployment.image.starts_with(&prefix))
    }

    /// Kubeconfig path with environment placeholders expanded, `None` when unset.
    pub fn kubeconfig_path(&self) -> Result<Option<PathBuf>> {
        if self.kubeconfig.is_empty() {
            return Ok(None);
        }
        let expanded = expand_env_vars(&self.kubeconfig)
            .with_context(|| format!("Failed to expand kubeconfig path {}", self.kubeconfig))?;
        Ok(Some(PathBuf::from(expanded)))
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(value) = var("CHECK_INTERVAL") {
            self.check_interval = parse_duration(&value)
                .with_context(|| format!("Invalid {}CHECK_INTERVAL", ENV_PREFIX))?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = var("KUBECONFIG") {
            self.kubeconfig = value;
        }
        if let Some(value) = var("WEBSERVER_PORT") {
            self.webserver.port = value
                .parse()
                .with_context(|| format!("Invalid {}WEBSERVER_PORT {}", ENV_PREFIX, value))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            bail!("checkInterval must be greater than zero");
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let mut config: Config =
        serde_yaml_ng::from_str(&yaml_str).context("Failed to parse YAML config")?;
    config.apply_env_overrides(|key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parses durations such as `30s`, `5m`, `1h30m` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let re = Regex::new(r"(\d+)(ms|s|m|h)").context("Invalid regex pattern for durations")?;
    let trimmed = input.trim();

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in re.captures_iter(trimmed) {
        let whole = caps.get(0).context("Regex match without group 0")?;
        if whole.start() != consumed {
            bail!("Invalid duration {:?}", input);
        }
        consumed = whole.end();

        let amount: u64 = caps[1]
            .parse()
            .with_context(|| format!("Invalid duration amount in {:?}", input))?;
        let part = match &caps[2] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            _ => amount.checked_mul(60 * 60).map(Duration::from_secs),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .with_context(|| format!("Duration {:?} is out of range", input))?;
    }

    if consumed == 0 || consumed != trimmed.len() {
        bail!("Invalid duration {:?}, expected e.g. 30s, 5m or 1h", input);
    }
    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn default_check_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}

fn default_registry_timeout() -> Duration {
    DEFAULT_REGISTRY_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_webserver_port() -> u16 {
    DEFAULT_WEBSERVER_PORT
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn image(name: &str, registry: &str) -> Image {
        Image {
            name: name.to_string(),
            registry: registry.to_string(),
            tag: "latest".to_string(),
        }
    }

    fn target(name: &str, image: &str) -> DeploymentTarget {
        DeploymentTarget {
            name: name.to_string(),
            namespace: "default".to_string(),
            container: "app".to_string(),
            image: image.to_string(),
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("x5m").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert!(parse_duration("9999999999999999h").is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
        assert!(parse_duration("18446744073709551615s1h").is_err());
    }

    #[test]
    fn test_image_key() {
        assert_eq!(image("nginx", "").key(), "/nginx:latest");
        assert_eq!(
            image("team/app", "https://ghcr.io").key(),
            "https://ghcr.io/team/app:latest"
        );
    }

    #[test]
    fn test_deployment_prefix_default_registry_is_bare_name() {
        assert_eq!(image("nginx", "").deployment_prefix(), "nginx");
        assert_eq!(
            image("nginx", DEFAULT_REGISTRY).deployment_prefix(),
            "nginx"
        );
    }

    #[test]
    fn test_deployment_prefix_strips_scheme() {
        assert_eq!(
            image("team/app", "https://ghcr.io").deployment_prefix(),
            "ghcr.io/team/app"
        );
        assert_eq!(
            image("app", "http://registry.local:5000").deployment_prefix(),
            "registry.local:5000/app"
        );
        assert_eq!(
            image("app", "registry.local").deployment_prefix(),
            "registry.local/app"
        );
    }

    #[test]
    fn test_deployments_for_matches_by_prefix() {
        let yaml = r#"
        registries:
          - name: "https://ghcr.io"
        images:
          - name: team/app
            registry: "https://ghcr.io"
            tag: main
        deployments:
          - { name: a, namespace: default, container: app, image: "ghcr.io/team/app:main" }
          - { name: b, namespace: default, container: app, image: "team/app:main" }
          - { name: c, namespace: default, container: app, image: "ghcr.io/team/other:main" }
        "#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        let matched: Vec<_> = config
            .deployments_for(&config.images[0])
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(matched, vec!["a"]);
    }

    #[test]
    fn test_find_registry() {
        let mut config: Config = serde_yaml_ng::from_str("registries: [{name: ''}]").unwrap();
        assert!(config.find_registry("").is_some());
        assert!(config.find_registry("https://ghcr.io").is_none());
        config.deployments.push(target("web", "nginx:latest"));
        assert_eq!(config.deployments_for(&image("nginx", "")).count(), 1);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(config.check_interval, DEFAULT_CHECK_INTERVAL);
        assert_eq!(config.registry_timeout, DEFAULT_REGISTRY_TIMEOUT);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.webserver.port, 8080);
        assert!(config.kubeconfig_path().unwrap().is_none());
        assert!(config.images.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let mut config: Config = serde_yaml_ng::from_str("checkInterval: 10m").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("KUBE_DIGEST_SYNC_CHECK_INTERVAL", "15m"),
            ("KUBE_DIGEST_SYNC_LOG_LEVEL", "warn"),
            ("KUBE_DIGEST_SYNC_WEBSERVER_PORT", "9090"),
        ]);
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.webserver.port, 9090);
    }

    #[test]
    fn test_env_override_rejects_bad_duration() {
        let mut config: Config = serde_yaml_ng::from_str("{}").unwrap();
        let result = config.apply_env_overrides(|key| {
            (key == "KUBE_DIGEST_SYNC_CHECK_INTERVAL").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_file() {
        let yaml_content = r#"
        checkInterval: 2m
        registryTimeout: 10s
        webserver:
          port: 8081
        registries:
          - name: ""
          - name: "https://registry.example.com"
            auth:
              username: robot
              password: ${REGISTRY_PASSWORD}
        images:
          - name: nginx
            tag: "1.27"
          - name: team/api
            registry: "https://registry.example.com"
        deployments:
          - name: web
            namespace: default
            container: nginx
            image: nginx:1.27
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.check_interval, Duration::from_secs(120));
        assert_eq!(config.registry_timeout, Duration::from_secs(10));
        assert_eq!(config.webserver.port, 8081);
        assert_eq!(config.registries.len(), 2);
        let auth = config.registries[1].auth.as_ref().unwrap();
        assert_eq!(auth.username, "robot");
        // placeholders survive loading and are expanded per request
        assert_eq!(auth.password.expose_secret(), "${REGISTRY_PASSWORD}");
        assert_eq!(config.images[0].registry, "");
        assert_eq!(config.images[1].tag, "latest");
        assert_eq!(config.deployments[0].container, "nginx");
    }

    #[test]
    fn test_load_config_rejects_zero_interval() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "checkInterval: 0s").expect("Failed to write to temp file");
        assert!(load_config(tmp_file.path()).is_err());
    }
}
