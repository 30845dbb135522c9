// Shader hot reload
//
// Watches the directories holding the SPIR-V files and reports when one of
// them is rewritten (e.g. by `cargo build` re-running glslc).

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

pub struct ShaderWatcher {
    // Kept alive for as long as events are wanted
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    shaders: Vec<PathBuf>,
}

impl ShaderWatcher {
    pub fn new(shaders: &[&Path]) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;

        let shaders: Vec<PathBuf> = shaders.iter().map(|path| absolute(path)).collect();

        // Editors often replace files instead of writing in place, so watch
        // the parent directory rather than the file itself.
        let directories: HashSet<PathBuf> = shaders
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        for dir in &directories {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            events,
            shaders,
        })
    }

    /// Drain pending events; true if any touched a watched shader
    pub fn changed(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.events.try_recv() {
            match event {
                Ok(event) => changed |= touches_shader(&event, &self.shaders),
                Err(e) => log::warn!("File watcher error: {}", e),
            }
        }
        changed
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Content changes, creations and renames onto one of `shaders`
pub fn touches_shader(event: &Event, shaders: &[PathBuf]) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_)
    );
    relevant && event.paths.iter().any(|path| shaders.iter().any(|s| s == path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind, RemoveKind};

    fn shaders() -> Vec<PathBuf> {
        vec![PathBuf::from("/app/shaders/cube.vert.spv"), PathBuf::from("/app/shaders/cube.frag.spv")]
    }

    #[test]
    fn rewrite_of_watched_shader_counts() {
        let event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/app/shaders/cube.frag.spv"));
        assert!(touches_shader(&event, &shaders()));

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/app/shaders/cube.vert.spv"));
        assert!(touches_shader(&event, &shaders()));
    }

    #[test]
    fn other_files_and_kinds_are_ignored() {
        let source = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/app/shaders/cube.frag"));
        assert!(!touches_shader(&source, &shaders()));

        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/app/shaders/cube.frag.spv"));
        assert!(!touches_shader(&removed, &shaders()));

        let read = Event::new(EventKind::Access(AccessKind::Read))
            .add_path(PathBuf::from("/app/shaders/cube.frag.spv"));
        assert!(!touches_shader(&read, &shaders()));
    }

    #[test]
    fn relative_paths_are_anchored_to_cwd() {
        let path = absolute(Path::new("shaders/cube.vert.spv"));
        assert!(path.is_absolute());
        assert!(path.ends_with("shaders/cube.vert.spv"));
    }
}
