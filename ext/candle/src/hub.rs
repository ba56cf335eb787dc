use hf_hub::api::sync::{Api, ApiBuilder, ApiError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{LoadError, Result};
use crate::options::LoaderOptions;

static LOGGED_IN: AtomicBool = AtomicBool::new(false);

/// Single-file weight names tried before falling back to a shard index.
const WEIGHT_FILES: [&str; 2] = ["model.safetensors", "diffusion_pytorch_model.safetensors"];
const INDEX_FILES: [&str; 2] = [
    "model.safetensors.index.json",
    "diffusion_pytorch_model.safetensors.index.json",
];

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Blocking HuggingFace hub client with an optional cache dir and token.
pub struct HubClient {
    api: Api,
    cache_dir: Option<PathBuf>,
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl HubClient {
    pub fn new(cache_dir: Option<&Path>, token: Option<&str>) -> Result<Self> {
        let token = usable_token(token);
        let mut builder = ApiBuilder::from_env().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        if token.is_some() {
            builder = builder.with_token(token.map(str::to_string));
            login(token);
        }
        Ok(Self {
            api: builder.build()?,
            cache_dir: cache_dir.map(Path::to_path_buf),
        })
    }

    /// Client for diffusers-layout repositories, cached under `diffusers_dir`.
    pub fn for_diffusers(options: &LoaderOptions) -> Result<Self> {
        Self::new(Some(&options.diffusers_dir), options.huggingface_token.as_deref())
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Download `subfolder/filename` from `repo_id` and return the local path.
    pub fn get(&self, repo_id: &str, subfolder: Option<&str>, filename: &str) -> Result<PathBuf> {
        let remote = remote_path(subfolder, filename);
        tracing::debug!(repo = repo_id, file = %remote, "hub download");
        Ok(self.api.model(repo_id.to_string()).get(&remote)?)
    }

    /// Prefer `local_root/subfolder/filename`, download it otherwise.
    pub fn local_or_hub(
        &self,
        local_root: &Path,
        repo_id: &str,
        subfolder: Option<&str>,
        filename: &str,
    ) -> Result<PathBuf> {
        let local = local_path(local_root, subfolder, filename);
        if local.is_file() {
            return Ok(local);
        }
        self.get(repo_id, subfolder, filename)
    }

    /// Resolve the safetensors files making up one component.
    ///
    /// A local directory is searched first; when it has no weights the hub
    /// repository is used. Sharded weights are listed through their index.
    pub fn safetensors_files(
        &self,
        local_root: Option<&Path>,
        repo_id: &str,
        subfolder: &str,
    ) -> Result<Vec<PathBuf>> {
        if let Some(root) = local_root {
            if let Some(files) = local_safetensors_files(&root.join(subfolder))? {
                return Ok(files);
            }
        }

        let get = |name: &str| self.get(repo_id, Some(subfolder), name);
        if let Some(path) = first_found(&WEIGHT_FILES, get)? {
            return Ok(vec![path]);
        }
        if let Some(index) = first_found(&INDEX_FILES, get)? {
            return shard_names(&index)?
                .iter()
                .map(|shard| self.get(repo_id, Some(subfolder), shard))
                .collect();
        }
        Err(LoadError::msg(format!(
            "no safetensors weights in {repo_id}/{subfolder}. Tried: {}, {}",
            WEIGHT_FILES.join(", "),
            INDEX_FILES.join(", ")
        )))
    }
}

/// Fetch the first candidate the repository has. Only a missing file moves
/// on to the next name; network and auth errors are returned.
fn first_found<T>(candidates: &[&str], mut get: impl FnMut(&str) -> Result<T>) -> Result<Option<T>> {
    for name in candidates {
        match get(name) {
            Ok(found) => return Ok(Some(found)),
            Err(e) if is_not_found(&e) => {
                tracing::debug!(file = name, "not on the hub");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Whether the hub answered 404 for a file.
pub fn is_not_found(err: &LoadError) -> bool {
    match err {
        LoadError::Hub(ApiError::RequestError(e)) => matches!(**e, ureq::Error::Status(404, _)),
        _ => false,
    }
}

/// Record the hub login once per process. Tokens of two chars or fewer are
/// treated as unset.
pub fn login(token: Option<&str>) -> bool {
    let Some(token) = usable_token(token) else {
        return false;
    };
    if !LOGGED_IN.swap(true, Ordering::SeqCst) {
        tracing::info!(token = %mask_token(token), "HF login");
    }
    true
}

fn usable_token(token: Option<&str>) -> Option<&str> {
    token.map(str::trim).filter(|t| t.len() > 2)
}

fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}...")
}

fn remote_path(subfolder: Option<&str>, filename: &str) -> String {
    match subfolder {
        Some(sub) if !sub.is_empty() => format!("{sub}/{filename}"),
        _ => filename.to_string(),
    }
}

fn local_path(root: &Path, subfolder: Option<&str>, filename: &str) -> PathBuf {
    match subfolder {
        Some(sub) if !sub.is_empty() => root.join(sub).join(filename),
        _ => root.join(filename),
    }
}

/// Weights of a local component directory, or `None` when it holds none.
pub fn local_safetensors_files(dir: &Path) -> Result<Option<Vec<PathBuf>>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for name in WEIGHT_FILES {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(Some(vec![path]));
        }
    }
    for name in INDEX_FILES {
        let index = dir.join(name);
        if index.is_file() {
            let files = shard_names(&index)?
                .into_iter()
                .map(|shard| dir.join(shard))
                .collect();
            return Ok(Some(files));
        }
    }
    Ok(None)
}

/// Distinct shard file names referenced by a `*.safetensors.index.json`.
pub fn shard_names(index: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(index)?;
    let index: ShardIndex = serde_json::from_str(&text)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_tokens_are_ignored() {
        assert_eq!(usable_token(Some("ab")), None);
        assert_eq!(usable_token(Some("  ")), None);
        assert_eq!(usable_token(Some("hf_x")), Some("hf_x"));
        assert!(!login(Some("no")));
        assert!(login(Some("hf_secret")));
        assert_eq!(mask_token("hf_secret"), "hf_s...");
    }

    fn status(code: u16) -> LoadError {
        let response = ureq::Response::new(code, "status", "").unwrap();
        LoadError::Hub(ApiError::RequestError(Box::new(ureq::Error::from(response))))
    }

    #[test]
    fn test_first_found_skips_missing_files() {
        let mut tried = Vec::new();
        let found = first_found(&WEIGHT_FILES, |name| {
            tried.push(name.to_string());
            match name {
                "model.safetensors" => Err(status(404)),
                other => Ok(other.to_string()),
            }
        })
        .unwrap();
        assert_eq!(found.as_deref(), Some("diffusion_pytorch_model.safetensors"));
        assert_eq!(tried.len(), 2);

        let none = first_found(&INDEX_FILES, |_| Err::<String, _>(status(404))).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_first_found_returns_hub_failures() {
        let gated = first_found(&WEIGHT_FILES, |_| Err::<String, _>(status(401)));
        assert!(matches!(gated, Err(ref e) if !is_not_found(e)));

        let mut calls = 0;
        let offline = first_found(&WEIGHT_FILES, |_| {
            calls += 1;
            let io = std::io::Error::new(std::io::ErrorKind::Other, "dns lookup failed");
            Err::<String, _>(LoadError::Hub(ApiError::RequestError(Box::new(io.into()))))
        });
        let err = offline.unwrap_err().to_string();
        assert!(err.contains("dns lookup failed"), "{err}");
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_diffusers_client_caches_in_diffusers_dir() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoaderOptions {
            diffusers_dir: dir.path().join("Diffusers"),
            hfcache_dir: Some(dir.path().join("hub")),
            ..Default::default()
        };
        let hub = HubClient::for_diffusers(&options).unwrap();
        assert_eq!(hub.cache_dir(), Some(dir.path().join("Diffusers").as_path()));
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path(Some("transformer"), "config.json"), "transformer/config.json");
        assert_eq!(remote_path(None, "ae.safetensors"), "ae.safetensors");
        assert_eq!(remote_path(Some(""), "ae.safetensors"), "ae.safetensors");
    }

    #[test]
    fn test_local_sharded_component() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("text_encoder_2");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(
            sub.join("model.safetensors.index.json"),
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let files = local_safetensors_files(&sub).unwrap().unwrap();
        assert_eq!(
            files,
            vec![
                sub.join("model-00001-of-00002.safetensors"),
                sub.join("model-00002-of-00002.safetensors"),
            ]
        );
        assert!(local_safetensors_files(&dir.path().join("missing")).unwrap().is_none());
    }
}
