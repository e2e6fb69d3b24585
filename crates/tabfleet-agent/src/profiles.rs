use std::path::{Path, PathBuf};

use anyhow::Context;
use tabfleet_process::{ProfileInfo, profile_id};

use crate::{
    error::{Error, Result},
    validation::validate_profile_name,
};

/// Maps profile ids and names onto directories under the base dir.
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    base_dir: PathBuf,
}

impl ProfileResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn list(&self) -> Result<Vec<ProfileInfo>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read {}", self.base_dir.display()))
                    .into());
            }
        };
        while let Some(entry) = rd
            .next_entry()
            .await
            .with_context(|| format!("read {}", self.base_dir.display()))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_dir || name.starts_with('.') {
                continue;
            }
            out.push(ProfileInfo {
                id: profile_id(&name),
                path: entry.path().display().to_string(),
                name,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn exists(&self, name: &str) -> bool {
        if validate_profile_name(name).is_err() {
            return false;
        }
        tokio::fs::metadata(self.base_dir.join(name))
            .await
            .is_ok_and(|m| m.is_dir())
    }

    /// Resolves a profile id (`prof_…`) or plain directory name to the
    /// profile name.
    pub async fn resolve(&self, id_or_name: &str) -> Result<String> {
        let id_or_name = id_or_name.trim();
        if let Some(found) = self
            .list()
            .await?
            .into_iter()
            .find(|p| p.id == id_or_name)
        {
            return Ok(found.name);
        }
        if self.exists(id_or_name).await {
            return Ok(id_or_name.to_string());
        }
        Err(Error::not_found(format!("profile {id_or_name:?} not found")))
    }

    /// Creates the profile's browser data directory if missing.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf> {
        validate_profile_name(name)?;
        let dir = self.base_dir.join(name);
        tokio::fs::create_dir_all(dir.join("Default"))
            .await
            .with_context(|| format!("create profile {}", dir.display()))?;
        Ok(dir)
    }
}
