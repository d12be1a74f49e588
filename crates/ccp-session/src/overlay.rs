use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Disposable home-directory overlay handed to the child when
/// `--disable-mcps` is set. The child sees a fresh `HOME` whose assistant
/// settings disable MCP servers; the operator's real configuration is
/// never touched. Removed at finalize.
#[derive(Debug)]
pub struct HomeOverlay {
    root: PathBuf,
}

impl HomeOverlay {
    pub fn create(output_dir: &Path) -> io::Result<Self> {
        let root = output_dir.join("home-overlay");
        let settings_dir = root.join(".claude");
        fs::create_dir_all(&settings_dir)?;

        let settings = json!({
            "enableAllProjectMcpServers": false,
            "enabledMcpjsonServers": [],
            "disabledMcpjsonServers": ["*"],
        });
        let payload = serde_json::to_vec_pretty(&settings)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(settings_dir.join("settings.json"), payload)?;
        Ok(Self { root })
    }

    /// Environment rewrites for the child process.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let home = self.root.to_string_lossy().to_string();
        vec![("HOME", home.clone()), ("USERPROFILE", home)]
    }

    pub fn remove(self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overlay_writes_settings_and_cleans_up() {
        let out = TempDir::new().expect("temp dir");
        let overlay = HomeOverlay::create(out.path()).expect("create overlay");

        let settings_path = out.path().join("home-overlay/.claude/settings.json");
        let contents = fs::read_to_string(&settings_path).expect("settings written");
        let parsed: serde_json::Value = serde_json::from_str(&contents).expect("valid json");
        assert_eq!(parsed["enableAllProjectMcpServers"], false);

        let env = overlay.child_env();
        assert!(env
            .iter()
            .any(|(key, value)| *key == "HOME" && value.ends_with("home-overlay")));

        overlay.remove().expect("remove overlay");
        assert!(!settings_path.exists());
    }
}
