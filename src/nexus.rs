use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, trace};
use regex::RegexSet;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;

use crate::retain::{self, ImageRecord, RetentionPolicy};

const DOCKER_CONFIG: &str = "~/.docker/config.json";

/// Docker configuration
#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    auth: String,
}

/// One page of the search and components endpoints
#[derive(Deserialize)]
struct ComponentPage {
    #[serde(default)]
    items: Vec<Component>,
    #[serde(rename = "continuationToken")]
    continuation_token: Option<String>,
}

#[derive(Deserialize)]
struct Component {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Deserialize)]
struct Asset {
    #[serde(default)]
    checksum: Checksum,
}

#[derive(Default, Deserialize)]
struct Checksum {
    #[serde(default)]
    sha256: String,
}

impl From<Component> for ImageRecord {
    fn from(component: Component) -> Self {
        let digest = component
            .assets
            .into_iter()
            .next()
            .map(|asset| asset.checksum.sha256)
            .unwrap_or_default();
        ImageRecord::new(component.name, component.version, digest)
    }
}

/// Registry credentials
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Credentials {
    Basic { username: String, password: String },
    /// Base64 `user:password` as stored by `docker login`
    Encoded(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Look up the registry in `~/.docker/config.json`.
    pub fn from_docker_config(url: &str) -> Result<Option<Self>> {
        let url = Url::parse(url).with_context(|| format!("Invalid registry URL: {url}"))?;
        let path = shellexpand::tilde(DOCKER_CONFIG).to_string();
        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_docker_config_str(&contents, &url)
                .with_context(|| format!("Failed to parse Docker config {path}")),
            Err(_) => Ok(None),
        }
    }

    fn from_docker_config_str(contents: &str, url: &Url) -> Result<Option<Self>> {
        let config: DockerConfig = serde_json::from_str(contents)?;
        let host = url.host_str().unwrap_or_default();
        let mut keys = Vec::with_capacity(3);
        if let Some(port) = url.port() {
            keys.push(format!("{host}:{port}"));
        }
        keys.push(host.to_string());
        keys.push(url.as_str().trim_end_matches('/').to_string());

        Ok(keys
            .iter()
            .find_map(|key| config.auths.get(key))
            .map(|a| Credentials::Encoded(a.auth.clone())))
    }

    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
            Credentials::Encoded(auth) => req.header(
                reqwest::header::AUTHORIZATION,
                format!("Basic {auth}"),
            ),
        }
    }
}

/// How patterns select images
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SearchMode {
    /// Server-side name search, one query per pattern
    #[default]
    Search,
    /// List every component and match names against regular expressions
    Regex,
}

/// A Docker repository hosted on a Nexus Repository Manager
#[derive(Debug)]
pub struct Nexus {
    api: Url,
    repository: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl Nexus {
    pub fn new(
        url: &str,
        repository: impl Into<String>,
        credentials: Option<Credentials>,
        verify_tls: bool,
    ) -> Result<Self> {
        let api = format!("{}/service/rest/v1/", url.trim_end_matches('/'));
        let api = Url::parse(&api).with_context(|| format!("Invalid Nexus URL: {url}"))?;
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .context("Failed to build HTTP client")?;

        let nexus = Nexus {
            api,
            repository: repository.into(),
            credentials,
            client,
        };
        info!("Nexus API: {}", nexus.api);
        info!("Repository: {}", nexus.repository);
        debug!(
            "Authentication: {}, TLS verification: {}",
            if nexus.credentials.is_some() { "enabled" } else { "disabled" },
            if verify_tls { "enabled" } else { "disabled" },
        );
        Ok(nexus)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .api
            .join(path)
            .with_context(|| format!("Failed to build URL for {path}"))?;
        url.query_pairs_mut()
            .append_pair("repository", &self.repository)
            .append_pair("format", "docker")
            .extend_pairs(params);
        Ok(url)
    }

    async fn fetch_page(&self, url: Url) -> Result<ComponentPage> {
        debug!("GET {url}");
        let mut req = self.client.get(url.clone());
        if let Some(credentials) = &self.credentials {
            req = credentials.apply(req);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        trace!("Response status: {}", resp.status());
        match resp.status() {
            StatusCode::OK => resp
                .json()
                .await
                .with_context(|| format!("Failed to parse JSON from {url}")),
            StatusCode::UNAUTHORIZED => Err(anyhow!("Authentication failed")),
            StatusCode::NOT_FOUND => Err(anyhow!("Repository not found: {}", self.repository)),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(anyhow!("HTTP error {status}: {body}"))
            }
        }
    }

    /// Fetch every page of `path`, following continuation tokens.
    async fn fetch_all(&self, path: &str, params: &[(&str, &str)]) -> Result<Vec<Component>> {
        let mut components = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut url = self.endpoint(path, params)?;
            if let Some(token) = &token {
                debug!("Fetching next page with token: {token}");
                url.query_pairs_mut().append_pair("continuationToken", token);
            }

            let page = self.fetch_page(url).await?;
            debug!("Found {} components in current page", page.items.len());
            components.extend(page.items);

            match page.continuation_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        Ok(components)
    }

    /// Collect the (name, tag, digest) records of images matching `patterns`.
    pub async fn search_images<S: AsRef<str>>(
        &self,
        patterns: &[S],
        mode: SearchMode,
    ) -> Result<Vec<ImageRecord>> {
        let patterns: Vec<&str> = patterns.iter().map(|p| p.as_ref()).collect();
        info!("Searching for patterns: {patterns:?}");

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        let mut collect = |components: Vec<Component>, filter: Option<&RegexSet>| {
            for component in components {
                if filter.is_some_and(|set| !set.is_match(&component.name)) {
                    trace!("Skipping unmatched image: {}", component.name);
                    continue;
                }
                let key = format!("{}:{}", component.name, component.version);
                if !seen.insert(key.clone()) {
                    debug!("Skipping duplicate image: {key}");
                    continue;
                }
                debug!("Found image: {key}");
                images.push(ImageRecord::from(component));
            }
        };

        match mode {
            SearchMode::Search => {
                for pattern in patterns.iter().copied() {
                    debug!("Searching with pattern: {pattern}");
                    let components = self.fetch_all("search", &[("name", pattern)]).await?;
                    collect(components, None);
                }
            }
            SearchMode::Regex => {
                let set = RegexSet::new(&patterns)
                    .with_context(|| format!("Invalid image name pattern in {patterns:?}"))?;
                let components = self.fetch_all("components", &[]).await?;
                collect(components, Some(&set));
            }
        }

        info!("Total matching images found: {}", images.len());
        Ok(images)
    }

    /// Search images and reduce each one's tags to the retained set.
    pub async fn search_and_reduce<S: AsRef<str>>(
        &self,
        patterns: &[S],
        mode: SearchMode,
        policy: &RetentionPolicy,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let images = self.search_images(patterns, mode).await?;
        if images.is_empty() {
            info!("No images found matching the patterns");
            return Ok(BTreeMap::new());
        }

        Ok(retain::group(&images, policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_into_record() {
        let component: Component = serde_json::from_str(
            r#"{
                "id": "abc",
                "repository": "docker-hosted",
                "format": "docker",
                "name": "team/app",
                "version": "12",
                "assets": [
                    {"checksum": {"sha1": "f00", "sha256": "d1"}},
                    {"checksum": {"sha256": "d2"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            ImageRecord::from(component),
            ImageRecord::new("team/app", "12", "d1")
        );
    }

    #[test]
    fn test_component_without_checksum() {
        let component: Component =
            serde_json::from_str(r#"{"name": "app", "version": "1", "assets": []}"#).unwrap();
        assert_eq!(ImageRecord::from(component).digest, "");

        let component: Component =
            serde_json::from_str(r#"{"name": "app", "version": "1", "assets": [{}]}"#).unwrap();
        assert_eq!(ImageRecord::from(component).digest, "");
    }

    #[test]
    fn test_endpoint() {
        let nexus = Nexus::new("http://nexus.local:8081///", "docker-hosted", None, true).unwrap();
        assert_eq!(nexus.api.as_str(), "http://nexus.local:8081/service/rest/v1/");

        let url = nexus.endpoint("search", &[("name", "team/app*")]).unwrap();
        assert_eq!(url.path(), "/service/rest/v1/search");
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            [
                ("repository".to_string(), "docker-hosted".to_string()),
                ("format".to_string(), "docker".to_string()),
                ("name".to_string(), "team/app*".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(Nexus::new("not a url", "docker-hosted", None, true).is_err());
    }

    #[test]
    fn test_docker_config_lookup() {
        let config = r#"{
            "auths": {
                "nexus.local:8443": {"auth": "cG9ydDpwYXNz"},
                "registry.example.com": {"auth": "aG9zdDpwYXNz"}
            }
        }"#;
        let lookup = |contents: &str, url: &str| {
            Credentials::from_docker_config_str(contents, &Url::parse(url).unwrap())
        };

        assert_eq!(
            lookup(config, "https://nexus.local:8443").unwrap(),
            Some(Credentials::Encoded("cG9ydDpwYXNz".to_string()))
        );
        assert_eq!(
            lookup(config, "https://registry.example.com/").unwrap(),
            Some(Credentials::Encoded("aG9zdDpwYXNz".to_string()))
        );
        assert_eq!(lookup(config, "http://other.local").unwrap(), None);
        assert_eq!(lookup("{}", "http://other.local").unwrap(), None);
        assert!(lookup("not json", "http://other.local").is_err());
    }

    #[test]
    fn test_docker_config_invalid_url() {
        let err = Credentials::from_docker_config("not a url").unwrap_err();
        assert_eq!(err.to_string(), "Invalid registry URL: not a url");
        assert!(err.chain().all(|cause| !cause.to_string().contains("Docker config")));
    }
}
