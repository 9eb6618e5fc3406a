//! The datapack this controller owns inside the server's world directory.

use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the managed datapack lives and how its functions are addressed.
#[derive(Debug, Clone)]
pub struct PackageLayout {
    /// `<rundir>/<world>/datapacks/<name>`
    root: PathBuf,
    name: String,
    namespace: String,
    description: String,
    pack_format: u32,
    function_dir: String,
}

impl PackageLayout {
    pub fn new(
        datapacks_dir: impl AsRef<Path>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            root: datapacks_dir.as_ref().join(&name),
            name,
            namespace: namespace.into(),
            description: "Generated by mscr".to_string(),
            pack_format: 48,
            function_dir: "function".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_pack_format(mut self, pack_format: u32) -> Self {
        self.pack_format = pack_format;
        self
    }

    /// Older hosts read `functions/` instead of `function/`.
    pub fn with_function_dir(mut self, function_dir: impl Into<String>) -> Self {
        self.function_dir = function_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.root
            .join("data")
            .join(&self.namespace)
            .join(&self.function_dir)
    }

    pub fn function_path(&self, job: &str) -> PathBuf {
        self.functions_dir().join(format!("{job}.mcfunction"))
    }

    /// `<namespace>:<job>`, the name the host knows the function by.
    pub fn qualified(&self, job: &str) -> String {
        format!("{}:{}", self.namespace, job)
    }

    /// Disable, re-enable, then run `job`.
    ///
    /// The host only rescans a pack on a state change, so the toggle makes
    /// it pick up a freshly written function file.
    pub fn trigger_directives(&self, job: &str) -> [String; 3] {
        [
            format!("datapack disable \"file/{}\"", self.name),
            format!("datapack enable \"file/{}\"", self.name),
            format!("function {}", self.qualified(job)),
        ]
    }

    /// Create a fresh, empty package.
    ///
    /// A package left behind by an earlier run is removed first. Failing to
    /// remove it is logged and the directories are created regardless.
    pub async fn prepare(&self) -> io::Result<()> {
        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
                warn!(path = %self.root.display(), error = %e, "failed to remove stale datapack");
            }
        }

        tokio::fs::create_dir_all(self.functions_dir()).await?;
        let descriptor = json!({
            "pack": {
                "pack_format": self.pack_format,
                "description": self.description,
            }
        });
        let descriptor = serde_json::to_string_pretty(&descriptor)?;
        tokio::fs::write(self.root.join("pack.mcmeta"), descriptor).await?;

        debug!(path = %self.root.display(), "datapack prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_functions_by_namespace() {
        let layout = PackageLayout::new("/srv/world/datapacks", "mscr", "mscr");
        assert_eq!(
            layout.function_path("job_1"),
            PathBuf::from("/srv/world/datapacks/mscr/data/mscr/function/job_1.mcfunction")
        );
        assert_eq!(
            layout.trigger_directives("job_1"),
            [
                "datapack disable \"file/mscr\"".to_string(),
                "datapack enable \"file/mscr\"".to_string(),
                "function mscr:job_1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn prepare_writes_descriptor_and_function_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PackageLayout::new(dir.path(), "pack", "ns")
            .with_pack_format(15)
            .with_function_dir("functions");

        layout.prepare().await.unwrap();

        assert!(layout.functions_dir().is_dir());
        let meta = std::fs::read_to_string(layout.root().join("pack.mcmeta")).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["pack"]["pack_format"], 15);
        assert_eq!(meta["pack"]["description"], "Generated by mscr");
    }

    #[tokio::test]
    async fn prepare_replaces_leftover_package() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PackageLayout::new(dir.path(), "pack", "ns");
        layout.prepare().await.unwrap();
        std::fs::write(layout.function_path("stale"), "say old").unwrap();

        layout.prepare().await.unwrap();

        assert!(!layout.function_path("stale").exists());
        assert!(layout.root().join("pack.mcmeta").exists());
    }
}
