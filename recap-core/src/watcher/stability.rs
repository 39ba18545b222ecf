use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
struct TrackedFile {
    last_size: u64,
    changed_at: Instant,
}

/// Debounces candidate files until their size stops changing.
#[derive(Debug)]
pub struct StabilityTracker {
    window: Duration,
    tracked: HashMap<PathBuf, TrackedFile>,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            tracked: HashMap::new(),
        }
    }

    /// Starts tracking `path`; repeated notifications for a tracked file
    /// are absorbed because growth is detected by polling.
    pub fn observe(&mut self, path: PathBuf, now: Instant) {
        if self.tracked.contains_key(&path) {
            return;
        }
        let size = file_size(&path).unwrap_or(0);
        debug!(path = %path.display(), size, "tracking file until it stops growing");
        self.tracked.insert(
            path,
            TrackedFile {
                last_size: size,
                changed_at: now,
            },
        );
    }

    /// Re-reads sizes and returns files unchanged for the whole window.
    /// Files that disappeared are dropped silently.
    pub fn poll(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        let mut vanished = Vec::new();
        for (path, tracked) in self.tracked.iter_mut() {
            let Some(size) = file_size(path) else {
                vanished.push(path.clone());
                continue;
            };
            if size != tracked.last_size {
                tracked.last_size = size;
                tracked.changed_at = now;
                continue;
            }
            if now.saturating_duration_since(tracked.changed_at) >= self.window {
                ready.push(path.clone());
            }
        }
        for path in vanished {
            debug!(path = %path.display(), "tracked file vanished");
            self.tracked.remove(&path);
        }
        for path in &ready {
            self.tracked.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn growth_resets_the_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.mp4");
        std::fs::write(&path, b"head").unwrap();

        let window = Duration::from_secs(15);
        let mut tracker = StabilityTracker::new(window);
        let t0 = Instant::now();
        tracker.observe(path.clone(), t0);

        assert!(tracker.poll(t0 + Duration::from_secs(10)).is_empty());
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"more frames")
            .unwrap();
        assert!(tracker.poll(t0 + Duration::from_secs(16)).is_empty());
        assert!(tracker.poll(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(tracker.poll(t0 + Duration::from_secs(31)), vec![path]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn repeated_observations_do_not_restart_the_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.mp4");
        std::fs::write(&path, b"data").unwrap();

        let mut tracker = StabilityTracker::new(Duration::from_secs(15));
        let t0 = Instant::now();
        tracker.observe(path.clone(), t0);
        tracker.observe(path.clone(), t0 + Duration::from_secs(14));
        assert_eq!(tracker.poll(t0 + Duration::from_secs(15)), vec![path]);
    }

    #[test]
    fn vanished_files_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.mp4");
        std::fs::write(&path, b"data").unwrap();

        let mut tracker = StabilityTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        tracker.observe(path.clone(), t0);
        std::fs::remove_file(&path).unwrap();
        assert!(tracker.poll(t0 + Duration::from_secs(5)).is_empty());
        assert!(tracker.is_empty());
    }
}
