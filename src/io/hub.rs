use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ModelSource;

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Paths to the files needed to run one pretrained model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Use a local model directory, checking that every file is present
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let files = Self {
            config: dir.join(CONFIG_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
            weights: dir.join(WEIGHTS_FILE),
        };

        for path in [&files.config, &files.tokenizer, &files.weights] {
            if !path.is_file() {
                bail!("Missing model file: {}", path.display());
            }
        }

        Ok(files)
    }
}

/// Downloads model files from the Hugging Face hub into a local cache
pub struct HubClient {
    client: reqwest::Client,
    endpoint: String,
    cache_dir: PathBuf,
}

impl HubClient {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let endpoint =
            std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            client,
            endpoint,
            cache_dir: cache_dir.into(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    /// Cache folder for one repository revision, e.g. `models/grammarly--coedit-large/main`
    pub fn repo_dir(&self, repo: &str, revision: &str) -> PathBuf {
        self.cache_dir
            .join("models")
            .join(repo.replace('/', "--"))
            .join(revision)
    }

    pub fn file_url(&self, repo: &str, revision: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, file)
    }

    /// Return the cached copy of `file`, downloading it first if needed
    pub async fn fetch(&self, repo: &str, revision: &str, file: &str) -> Result<PathBuf> {
        let dir = self.repo_dir(repo, revision);
        let path = dir.join(file);
        if path.is_file() {
            log::debug!("Using cached {}", path.display());
            return Ok(path);
        }

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;

        let url = self.file_url(repo, revision, file);
        self.download(&url, &path)
            .await
            .with_context(|| format!("Failed to download {}", url))?;

        Ok(path)
    }

    /// Resolve every file of a model source
    pub async fn resolve(&self, source: &ModelSource) -> Result<ModelFiles> {
        if let Some(dir) = &source.local_dir {
            log::info!("Using local model directory: {}", dir.display());
            return ModelFiles::in_dir(dir);
        }

        log::info!("Resolving {} ({}) from the hub", source.repo, source.revision);
        Ok(ModelFiles {
            config: self.fetch(&source.repo, &source.revision, CONFIG_FILE).await?,
            tokenizer: self.fetch(&source.repo, &source.revision, TOKENIZER_FILE).await?,
            weights: self.fetch(&source.repo, &source.revision, WEIGHTS_FILE).await?,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("Hub returned error status: {}", response.status()));
        }

        let pb = match response.content_length() {
            Some(len) => {
                let pb = ProgressBar::new(len);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
                        .progress_chars("#>-"),
                );
                pb
            }
            None => ProgressBar::new_spinner(),
        };
        pb.set_message(
            dest.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
        );

        // Stream into a temporary file so an interrupted download never looks cached
        let partial = dest.with_extension("part");
        let result = write_body(response, &partial, &pb).await.and_then(|()| {
            fs::rename(&partial, dest)
                .with_context(|| format!("Failed to move download into place: {}", dest.display()))
        });
        pb.finish_and_clear();

        if let Err(e) = result {
            if partial.exists() {
                if let Err(remove_err) = fs::remove_file(&partial) {
                    log::warn!("Failed to remove {}: {}", partial.display(), remove_err);
                }
            }
            return Err(e);
        }

        log::info!("Downloaded {}", dest.display());
        Ok(())
    }
}

async fn write_body(mut response: reqwest::Response, path: &Path, pb: &ProgressBar) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)?;
        pb.inc(chunk.len() as u64);
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "writing-assistant-{}-{:016x}",
            name,
            rand::random::<u64>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Local stand-in for the hub serving every file as `WEIGHTS`
    async fn file_server() -> String {
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/:repo/resolve/:revision/:file", get(|| async { "WEIGHTS" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_download_into_cache() {
        let cache = scratch_dir("download");
        let hub = HubClient::new(&cache).unwrap().with_endpoint(&file_server().await);

        let path = hub.fetch("gpt2", "main", WEIGHTS_FILE).await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "WEIGHTS");
        assert!(!path.with_extension("part").exists());

        fs::remove_dir_all(cache).unwrap();
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let cache = scratch_dir("download-fail");
        let hub = HubClient::new(&cache).unwrap().with_endpoint(&file_server().await);

        // A non-empty directory where the file should go makes the final rename fail
        let dest = hub.repo_dir("gpt2", "main").join(WEIGHTS_FILE);
        fs::create_dir_all(dest.join("occupied")).unwrap();

        assert!(hub.fetch("gpt2", "main", WEIGHTS_FILE).await.is_err());
        assert!(!dest.with_extension("part").exists());

        fs::remove_dir_all(cache).unwrap();
    }

    #[test]
    fn test_repo_dir_and_url() {
        let hub = HubClient::new("/tmp/cache").unwrap().with_endpoint("http://mirror.local/");
        assert_eq!(
            hub.repo_dir("grammarly/coedit-large", "main"),
            PathBuf::from("/tmp/cache/models/grammarly--coedit-large/main")
        );
        assert_eq!(
            hub.file_url("gpt2", "main", WEIGHTS_FILE),
            "http://mirror.local/gpt2/resolve/main/model.safetensors"
        );
    }

    #[tokio::test]
    async fn test_fetch_uses_cache() {
        let cache = scratch_dir("hub-cache");
        // Unroutable endpoint: any network access would fail the test
        let hub = HubClient::new(&cache).unwrap().with_endpoint("http://127.0.0.1:9");

        let dir = hub.repo_dir("gpt2", "main");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();

        let path = hub.fetch("gpt2", "main", CONFIG_FILE).await.unwrap();
        assert_eq!(path, dir.join(CONFIG_FILE));
        assert!(hub.fetch("gpt2", "main", WEIGHTS_FILE).await.is_err());

        fs::remove_dir_all(cache).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_local_dir() {
        let dir = scratch_dir("local-model");
        for file in [CONFIG_FILE, TOKENIZER_FILE] {
            fs::write(dir.join(file), "{}").unwrap();
        }

        let source = ModelSource {
            repo: "gpt2".to_string(),
            revision: "main".to_string(),
            local_dir: Some(dir.clone()),
        };
        let hub = HubClient::new(&dir).unwrap();
        let err = hub.resolve(&source).await.unwrap_err();
        assert!(err.to_string().contains(WEIGHTS_FILE));

        fs::write(dir.join(WEIGHTS_FILE), b"").unwrap();
        let files = hub.resolve(&source).await.unwrap();
        assert_eq!(files.weights, dir.join(WEIGHTS_FILE));

        fs::remove_dir_all(dir).unwrap();
    }
}
