use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::manifest::PluginManifest;

#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub root_dir: PathBuf,
}

/// Finds plugins laid out as `<root>/<plugin>/plugin.json`.
pub struct PluginLoader {
    root: PathBuf,
}

impl PluginLoader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sorted by directory name. Unreadable manifests fail the whole scan.
    pub fn discover(&self) -> anyhow::Result<Vec<LoadedPlugin>> {
        let mut items = Vec::new();
        if !self.root.exists() {
            warn!(root = %self.root.display(), "plugin directory does not exist");
            return Ok(items);
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        for path in dirs {
            if let Some(manifest) = Self::read_manifest(&path)? {
                debug!(plugin = %manifest.name, dir = %path.display(), "plugin discovered");
                items.push(LoadedPlugin { manifest, root_dir: path });
            }
        }
        Ok(items)
    }

    fn read_manifest(dir: &Path) -> anyhow::Result<Option<PluginManifest>> {
        let manifest_path = dir.join("plugin.json");
        if !manifest_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest = PluginManifest::parse(&data)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, dir: &str, manifest: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("plugin.json"), manifest).unwrap();
    }

    #[test]
    fn discovers_plugins_with_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(
            tmp.path(),
            "b-plugin",
            r#"{ "name": "b", "version": "1", "widget": { "type": "t", "component": "C" } }"#,
        );
        write_plugin(
            tmp.path(),
            "a-plugin",
            r#"{ "name": "a", "version": "1", "widgets": [{ "type": "t", "component": "C" }] }"#,
        );
        fs::create_dir_all(tmp.path().join("no-manifest")).unwrap();
        fs::write(tmp.path().join("stray.json"), "{}").unwrap();

        let found = PluginLoader::new(tmp.path().to_path_buf()).discover().unwrap();
        let names: Vec<_> = found.iter().map(|p| p.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(found[0].root_dir.ends_with("a-plugin"));
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new(tmp.path().join("nope"));
        assert!(loader.discover().unwrap().is_empty());
    }

    #[test]
    fn broken_manifest_names_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "bad", r#"{ "name": "bad", "version": "1" }"#);
        let err = PluginLoader::new(tmp.path().to_path_buf()).discover().unwrap_err();
        assert!(format!("{err:#}").contains("plugin.json"));
    }
}
