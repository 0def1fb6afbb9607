//! Recursive watch on the object directory, delivered over a bounded channel.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use notify::{
    event::{ModifyKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Delete,
    Modify,
    Move,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeAction::Add => "ADD",
            ChangeAction::Delete => "DELETE",
            ChangeAction::Modify => "MODIFIED",
            ChangeAction::Move => "MOVE",
        })
    }
}

/// One filesystem change, split into directory and file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub directory: String,
    pub filename: String,
    /// Name before a rename, when the platform reports both sides
    pub previous_filename: Option<String>,
}

impl ChangeEvent {
    pub fn new(action: ChangeAction, path: &Path) -> Option<Self> {
        let directory = path.parent()?.to_string_lossy().into_owned();
        let filename = path.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            action,
            directory,
            filename,
            previous_filename: None,
        })
    }

    /// Translate a notify event. Access notifications are dropped.
    pub fn from_notify(event: &Event) -> Vec<Self> {
        let single = |action: ChangeAction| -> Vec<ChangeEvent> {
            event
                .paths
                .iter()
                .filter_map(|path| ChangeEvent::new(action, path))
                .collect()
        };

        match event.kind {
            EventKind::Create(_) => single(ChangeAction::Add),
            EventKind::Remove(_) => single(ChangeAction::Delete),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let [from, to] = event.paths.as_slice() else {
                    return single(ChangeAction::Move);
                };
                ChangeEvent::new(ChangeAction::Move, to)
                    .map(|mut change| {
                        change.previous_filename = from
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned());
                        change
                    })
                    .into_iter()
                    .collect()
            }
            // The source side of a rename is gone from the store's point of view
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(ChangeAction::Delete),
            EventKind::Modify(ModifyKind::Name(_)) => single(ChangeAction::Move),
            EventKind::Modify(_) => single(ChangeAction::Modify),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action, self.directory, self.filename)?;
        if let Some(previous) = &self.previous_filename {
            write!(f, " -> {}", previous)?;
        }
        Ok(())
    }
}

/// Keeps the watch registered; dropping it stops event delivery and closes the channel.
pub struct ObjectWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl ObjectWatcher {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Start a recursive watch on `root`. Events are delivered in FIFO order on a
/// channel of `capacity`; when it is full the watcher thread blocks.
pub fn watch_objects(
    root: &Path,
    capacity: usize,
) -> Result<(ObjectWatcher, mpsc::Receiver<ChangeEvent>), Error> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for change in ChangeEvent::from_notify(&event) {
                    // The callback runs on notify's own thread, outside the runtime
                    if tx.blocking_send(change).is_err() {
                        tracing::debug!("Change channel closed, dropping event");
                        return;
                    }
                }
            }
            Err(e) => tracing::error!("Watcher error: {}", e),
        },
        Config::default(),
    )
    .map_err(|e| Error::StoreUnavailable(format!("failed to create watcher: {}", e)))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| {
            Error::StoreUnavailable(format!("failed to watch {}: {}", root.display(), e))
        })?;

    tracing::info!("Watching {} for changes", root.display());
    Ok((
        ObjectWatcher {
            _watcher: watcher,
            root: root.to_path_buf(),
        },
        rx,
    ))
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    use super::*;

    const OBJECT: &str = "/repo/.git/objects/a9/06cb2a4a904a152e80877d4088654daad0c859";

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[test]
    fn test_create_maps_to_add() {
        let changes = ChangeEvent::from_notify(&event(EventKind::Create(CreateKind::File), &[OBJECT]));
        assert_eq!(
            changes,
            vec![ChangeEvent {
                action: ChangeAction::Add,
                directory: "/repo/.git/objects/a9".to_string(),
                filename: "06cb2a4a904a152e80877d4088654daad0c859".to_string(),
                previous_filename: None,
            }]
        );
    }

    #[test]
    fn test_rename_both_keeps_previous_name() {
        let changes = ChangeEvent::from_notify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/repo/.git/objects/a9/tmp_obj_q1w2e3", OBJECT],
        ));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Move);
        assert_eq!(changes[0].filename, "06cb2a4a904a152e80877d4088654daad0c859");
        assert_eq!(changes[0].previous_filename.as_deref(), Some("tmp_obj_q1w2e3"));
        assert_eq!(
            changes[0].to_string(),
            format!("MOVE /repo/.git/objects/a9 {} -> tmp_obj_q1w2e3", &OBJECT[22..])
        );
    }

    #[test]
    fn test_other_kinds() {
        let modify = ChangeEvent::from_notify(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &[OBJECT],
        ));
        assert_eq!(modify[0].action, ChangeAction::Modify);

        let moved_in = ChangeEvent::from_notify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &[OBJECT],
        ));
        assert_eq!(moved_in[0].action, ChangeAction::Move);

        let moved_out = ChangeEvent::from_notify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &[OBJECT],
        ));
        assert_eq!(moved_out[0].action, ChangeAction::Delete);

        let removed = ChangeEvent::from_notify(&event(EventKind::Remove(RemoveKind::File), &[OBJECT]));
        assert_eq!(removed[0].action, ChangeAction::Delete);

        let access = ChangeEvent::from_notify(&event(EventKind::Access(AccessKind::Any), &[OBJECT]));
        assert!(access.is_empty());
    }
}
