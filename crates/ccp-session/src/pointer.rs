use ccp_core::schema::{ActiveSessionPointer, POINTER_SCHEMA_VERSION};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default per-user state directory, `<home>/.cc-profiler`.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cc-profiler"))
}

pub fn pointer_path(state_dir: &Path) -> PathBuf {
    state_dir.join("active-session.json")
}

/// Writes the active-session pointer, overwriting any stale one from a
/// crashed session.
pub fn write(
    state_dir: &Path,
    output_dir: &Path,
    markers_path: &Path,
    started_at_iso: &str,
    started_at_ms_epoch: i64,
) -> io::Result<()> {
    let pointer = ActiveSessionPointer {
        schema_version: POINTER_SCHEMA_VERSION.to_string(),
        output_dir: output_dir.to_string_lossy().to_string(),
        markers_path: markers_path.to_string_lossy().to_string(),
        started_at_iso: started_at_iso.to_string(),
        started_at_ms_epoch,
    };
    fs::create_dir_all(state_dir)?;
    let payload = serde_json::to_vec_pretty(&pointer)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(pointer_path(state_dir), payload)
}

/// Best-effort read for sibling `mark` invocations. A missing, stale, or
/// malformed pointer yields `None`.
pub fn read(state_dir: &Path) -> Option<ActiveSessionPointer> {
    let contents = fs::read_to_string(pointer_path(state_dir)).ok()?;
    let pointer: ActiveSessionPointer = serde_json::from_str(&contents).ok()?;
    if pointer.schema_version != POINTER_SCHEMA_VERSION {
        return None;
    }
    if !Path::new(&pointer.output_dir).is_absolute() {
        return None;
    }
    Some(pointer)
}

pub fn delete(state_dir: &Path) -> io::Result<()> {
    match fs::remove_file(pointer_path(state_dir)) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_delete_roundtrip() {
        let state = TempDir::new().expect("temp dir");
        let output = state.path().join("session-out");
        let markers = output.join("markers.jsonl");

        write(
            state.path(),
            &output,
            &markers,
            "2026-03-01T10:00:00+00:00",
            1_750_000_000_000,
        )
        .expect("write pointer");

        let pointer = read(state.path()).expect("pointer present");
        assert_eq!(pointer.schema_version, POINTER_SCHEMA_VERSION);
        assert_eq!(pointer.started_at_ms_epoch, 1_750_000_000_000);
        assert!(pointer.markers_path.ends_with("markers.jsonl"));

        delete(state.path()).expect("delete pointer");
        assert!(read(state.path()).is_none());
        // Deleting again is not an error.
        delete(state.path()).expect("idempotent delete");
    }

    #[test]
    fn relative_output_dir_is_rejected_on_read() {
        let state = TempDir::new().expect("temp dir");
        let raw = r#"{"schemaVersion":"1","outputDir":"relative/dir","markersPath":"m.jsonl","startedAtIso":"x","startedAtMsEpoch":0}"#;
        fs::create_dir_all(state.path()).expect("mkdir");
        fs::write(pointer_path(state.path()), raw).expect("seed");
        assert!(read(state.path()).is_none());
    }

    #[test]
    fn malformed_pointer_reads_as_none() {
        let state = TempDir::new().expect("temp dir");
        fs::create_dir_all(state.path()).expect("mkdir");
        fs::write(pointer_path(state.path()), "{not json").expect("seed");
        assert!(read(state.path()).is_none());
    }
}
