use super::{extract_role, extract_timestamp_epoch_ms, RecordRole};
use ccp_core::schema::ExternalLogSizeSample;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

const MAX_SCAN_ENTRIES: usize = 15_000;
const MTIME_SLACK_MS: i64 = 10_000;
const PROJECT_DIR_DEPTH: usize = 2;
const ROOT_FALLBACK_DEPTH: usize = 6;
const CONTENT_CANDIDATES: usize = 25;
const TAIL_READ_BYTES: u64 = 512 * 1024;
const MAX_SCORED_RECORDS: usize = 2_000;

#[derive(Debug, Clone)]
pub struct JsonlTrackerConfig {
    pub override_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    /// `<home>/.claude/projects` in production, overridable for tests.
    pub projects_root: PathBuf,
    pub started_at_ms_epoch: i64,
    /// When false (default) selection consults filesystem metadata only.
    pub allow_read_for_selection: bool,
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size_bytes: u64,
    mtime_ms: i64,
}

/// Selects and size-samples the conversation log the target process is
/// appending to. Selection is lazy: it runs on the first query and again
/// whenever the previously-selected file disappears.
#[derive(Debug)]
pub struct JsonlTracker {
    config: JsonlTrackerConfig,
    selected: Option<PathBuf>,
}

impl JsonlTracker {
    pub fn new(config: JsonlTrackerConfig) -> Self {
        Self {
            config,
            selected: None,
        }
    }

    pub fn selected_path(&mut self) -> Option<PathBuf> {
        if let Some(path) = &self.selected {
            if path.exists() {
                return self.selected.clone();
            }
            debug!("selected log vanished, re-selecting");
        }
        self.selected = self.select();
        self.selected.clone()
    }

    /// Best-effort size snapshot at a turn boundary.
    pub fn sample(&mut self, turn_index: u32, t_ms: u64) -> Option<ExternalLogSizeSample> {
        let path = self.selected_path()?;
        let metadata = std::fs::metadata(path).ok()?;
        Some(ExternalLogSizeSample {
            turn_index,
            t_ms,
            size_bytes: metadata.len(),
        })
    }

    fn select(&self) -> Option<PathBuf> {
        if let Some(override_path) = &self.config.override_path {
            return override_path.exists().then(|| override_path.clone());
        }

        let (root, max_depth) = self.scan_root();
        let candidates = collect_candidates(
            &root,
            max_depth,
            self.config.started_at_ms_epoch - MTIME_SLACK_MS,
        );
        if candidates.is_empty() {
            return None;
        }

        if self.config.allow_read_for_selection {
            if let Some(path) = select_by_content(&candidates, self.config.started_at_ms_epoch) {
                return Some(path);
            }
        }
        select_by_size(&candidates)
    }

    fn scan_root(&self) -> (PathBuf, usize) {
        if let Some(cwd) = &self.config.cwd {
            let project_dir = self.config.projects_root.join(project_dir_name(cwd));
            if project_dir.is_dir() {
                return (project_dir, PROJECT_DIR_DEPTH);
            }
        }
        (self.config.projects_root.clone(), ROOT_FALLBACK_DEPTH)
    }
}

/// Deterministic project directory name: every non-alphanumeric character
/// of the absolute cwd becomes `-`.
pub fn project_dir_name(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Breadth-first scan bounded by depth and a global entry cap.
fn collect_candidates(root: &Path, max_depth: usize, min_mtime_ms: i64) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((root.to_path_buf(), 0usize));
    let mut visited = 0usize;

    while let Some((dir, depth)) = queue.pop_front() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            visited += 1;
            if visited > MAX_SCAN_ENTRIES {
                return candidates;
            }
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                if depth + 1 < max_depth {
                    queue.push_back((path, depth + 1));
                }
                continue;
            }
            let is_jsonl = path
                .file_name()
                .map(|name| name.to_string_lossy().ends_with(".jsonl"))
                .unwrap_or(false);
            if !is_jsonl {
                continue;
            }
            let mtime = mtime_ms(&metadata);
            if mtime < min_mtime_ms {
                continue;
            }
            candidates.push(Candidate {
                path,
                size_bytes: metadata.len(),
                mtime_ms: mtime,
            });
        }
    }
    candidates
}

/// No-read policy: largest file wins, newer mtime breaks ties. Guarantees
/// no log content is touched.
fn select_by_size(candidates: &[Candidate]) -> Option<PathBuf> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.size_bytes
                .cmp(&b.size_bytes)
                .then(a.mtime_ms.cmp(&b.mtime_ms))
        })
        .map(|candidate| candidate.path.clone())
}

#[derive(Debug, Default)]
struct TailStats {
    user_records: u64,
    assistant_records: u64,
    timestamped_records: u64,
    in_window_records: u64,
    parsed_records: u64,
}

/// Opt-in content-aware policy: score bounded tails of the most recently
/// modified candidates. Falls back to the size policy when nothing scores.
fn select_by_content(candidates: &[Candidate], started_at_ms_epoch: i64) -> Option<PathBuf> {
    let mut recent: Vec<&Candidate> = candidates.iter().collect();
    recent.sort_by(|a, b| b.mtime_ms.cmp(&a.mtime_ms));
    recent.truncate(CONTENT_CANDIDATES);

    let mut best: Option<(i64, &Candidate)> = None;
    for candidate in recent {
        let Some(tail) = read_tail(&candidate.path) else {
            continue;
        };
        let stats = scan_tail(&tail, started_at_ms_epoch);
        let score = score_candidate(&stats, candidate.size_bytes);
        if score == 0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_score, best_candidate)) => {
                score > *best_score
                    || (score == *best_score && candidate.size_bytes > best_candidate.size_bytes)
            }
        };
        if better {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, candidate)| candidate.path.clone())
}

/// Reads up to the last 512 KiB. When the read starts mid-file the first
/// (partial) line is discarded.
fn read_tail(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let size = file.metadata().ok()?.len();
    let offset = size.saturating_sub(TAIL_READ_BYTES);
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut buffer = Vec::with_capacity((size - offset) as usize);
    file.read_to_end(&mut buffer).ok()?;
    let mut text = String::from_utf8_lossy(&buffer).into_owned();
    if offset > 0 {
        match text.find('\n') {
            Some(newline) => text.drain(..=newline),
            None => return Some(String::new()),
        };
    }
    Some(text)
}

fn scan_tail(tail: &str, started_at_ms_epoch: i64) -> TailStats {
    let mut stats = TailStats::default();
    for line in tail.lines() {
        if stats.parsed_records as usize >= MAX_SCORED_RECORDS {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        stats.parsed_records += 1;
        match extract_role(&record) {
            Some(RecordRole::User) => stats.user_records += 1,
            Some(RecordRole::Assistant) => stats.assistant_records += 1,
            None => {}
        }
        if let Some(timestamp) = extract_timestamp_epoch_ms(&record) {
            stats.timestamped_records += 1;
            if timestamp >= started_at_ms_epoch - MTIME_SLACK_MS {
                stats.in_window_records += 1;
            }
        }
    }
    stats
}

fn score_candidate(stats: &TailStats, size_bytes: u64) -> i64 {
    let mut score = 0i64;
    if stats.user_records > 0 {
        score += 1_000_000;
    }
    if stats.assistant_records > 0 {
        score += 500_000;
    }
    if stats.timestamped_records > 0 {
        score += 100_000;
    }
    if stats.in_window_records > 0 {
        score += 200_000;
    }
    score += stats.user_records.min(500) as i64 * 10_000;
    score += stats.assistant_records.min(500) as i64 * 5_000;
    score += stats.timestamped_records.min(5_000) as i64 * 10;
    score += stats.parsed_records.min(2_000) as i64;
    score += ((size_bytes / 1024).min(50_000)) as i64;
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_dir_name_flattens_separators() {
        assert_eq!(
            project_dir_name(Path::new("/home/dev/my_project")),
            "-home-dev-my-project"
        );
        assert_eq!(project_dir_name(Path::new("/a/b.c")), "-a-b-c");
    }

    #[test]
    fn size_policy_prefers_larger_then_newer() {
        let candidates = vec![
            Candidate {
                path: PathBuf::from("/a.jsonl"),
                size_bytes: 10,
                mtime_ms: 200,
            },
            Candidate {
                path: PathBuf::from("/b.jsonl"),
                size_bytes: 500,
                mtime_ms: 100,
            },
            Candidate {
                path: PathBuf::from("/c.jsonl"),
                size_bytes: 500,
                mtime_ms: 150,
            },
        ];
        assert_eq!(
            select_by_size(&candidates),
            Some(PathBuf::from("/c.jsonl"))
        );
    }

    #[test]
    fn scoring_weights_rank_conversation_over_snapshot() {
        let conversation = TailStats {
            user_records: 1,
            assistant_records: 0,
            timestamped_records: 0,
            in_window_records: 0,
            parsed_records: 1,
        };
        let snapshot = TailStats {
            user_records: 0,
            assistant_records: 0,
            timestamped_records: 0,
            in_window_records: 0,
            parsed_records: 2_000,
        };
        // A single user-role record outweighs two thousand snapshot rows
        // plus a large size advantage.
        assert!(score_candidate(&conversation, 64) > score_candidate(&snapshot, 50_000 * 1024));
    }

    #[test]
    fn per_record_weights_are_capped() {
        let many_users = TailStats {
            user_records: 2_000,
            ..TailStats::default()
        };
        let capped = TailStats {
            user_records: 500,
            ..TailStats::default()
        };
        assert_eq!(
            score_candidate(&many_users, 0),
            score_candidate(&capped, 0)
        );
    }
}
