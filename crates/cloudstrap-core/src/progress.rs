use std::sync::Mutex;
use tracing::info;

/// Where the installer reports task progress.
pub trait ProgressDisplay: Send + Sync {
    fn register_tasks(&self, tasks: &[&str]);

    fn start_task(&self, task: &str);

    fn stop_current_task(&self);

    fn info_message(&self, message: &str);

    /// Short-lived status line, e.g. a relation being requeued.
    fn status_info_message(&self, message: &str);
}

/// Progress reported through `tracing` only.
#[derive(Debug, Default)]
pub struct LogProgress {
    current: Mutex<Option<String>>,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressDisplay for LogProgress {
    fn register_tasks(&self, tasks: &[&str]) {
        info!("tasks: {}", tasks.join(", "));
    }

    fn start_task(&self, task: &str) {
        info!("starting: {task}");
        if let Ok(mut current) = self.current.lock() {
            *current = Some(task.to_owned());
        }
    }

    fn stop_current_task(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(task) = current.take() {
                info!("finished: {task}");
            }
        }
    }

    fn info_message(&self, message: &str) {
        info!("{message}");
    }

    fn status_info_message(&self, message: &str) {
        info!("{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Registered(Vec<String>),
    Started(String),
    Stopped,
    Info(String),
    Status(String),
}

/// Collects every progress call; used by tests and `--json` output.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Names of started tasks, in order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Started(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ProgressDisplay for RecordingProgress {
    fn register_tasks(&self, tasks: &[&str]) {
        self.push(ProgressEvent::Registered(
            tasks.iter().map(|t| (*t).to_owned()).collect(),
        ));
    }

    fn start_task(&self, task: &str) {
        self.push(ProgressEvent::Started(task.to_owned()));
    }

    fn stop_current_task(&self) {
        self.push(ProgressEvent::Stopped);
    }

    fn info_message(&self, message: &str) {
        self.push(ProgressEvent::Info(message.to_owned()));
    }

    fn status_info_message(&self, message: &str) {
        self.push(ProgressEvent::Status(message.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_keeps_order() {
        let p = RecordingProgress::new();
        p.register_tasks(&["a", "b"]);
        p.start_task("a");
        p.info_message("hello");
        p.stop_current_task();
        p.start_task("b");
        assert_eq!(p.started(), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(p.events().len(), 5);
        assert_eq!(
            p.events()[0],
            ProgressEvent::Registered(vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn log_progress_tracks_current_task() {
        let p = LogProgress::new();
        p.start_task("Creating container");
        p.stop_current_task();
        p.stop_current_task();
        assert!(p.current.lock().unwrap().is_none());
    }
}
