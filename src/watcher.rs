// Shader hot reload
//
// The notify callback runs on the watcher's own thread and only forwards
// changed SPIR-V paths over a channel. The render thread polls and
// rebuilds pipelines itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Drops repeat events for a path inside the debounce window
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    fn accept(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(path) {
            if now.duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_seen.insert(path.to_path_buf(), now);
        true
    }
}

fn is_shader_binary(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "spv")
}

/// Watches a shader directory for rebuilt `.spv` files
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<PathBuf>,
    dir: PathBuf,
}

impl ShaderWatcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let mut debouncer = Debouncer::new(DEBOUNCE);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let now = Instant::now();
                for path in event.paths {
                    if is_shader_binary(&path) && debouncer.accept(&path, now) {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => log::warn!("Shader watcher error: {}", e),
        })
        .context("Failed to create shader watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch shader directory {:?}", dir))?;
        log::info!("Watching {:?} for shader changes", dir);

        Ok(Self {
            _watcher: watcher,
            rx,
            dir,
        })
    }

    /// Changed shader files since the last poll, without blocking
    pub fn poll(&self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = self.rx.try_iter().collect();
        changed.sort();
        changed.dedup();
        changed
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_spirv_files_count() {
        assert!(is_shader_binary(Path::new("shaders/quad.vert.spv")));
        assert!(!is_shader_binary(Path::new("shaders/quad.vert")));
        assert!(!is_shader_binary(Path::new("shaders")));
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let path = Path::new("quad.frag.spv");
        let start = Instant::now();

        assert!(debouncer.accept(path, start));
        assert!(!debouncer.accept(path, start + Duration::from_millis(50)));
        assert!(debouncer.accept(Path::new("line.frag.spv"), start + Duration::from_millis(50)));
        assert!(debouncer.accept(path, start + Duration::from_millis(150)));
    }
}
