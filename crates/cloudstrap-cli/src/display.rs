use crate::commands::{spin_fail, spin_ok, spinner};
use cloudstrap_core::ProgressDisplay;
use console::Style;
use indicatif::ProgressBar;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    tasks: Vec<String>,
    current: Option<(String, ProgressBar)>,
}

/// Spinner per install task, numbered against the registered task list.
#[derive(Default)]
pub struct TerminalProgress {
    state: Mutex<State>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the running task as failed, if any.
    pub fn fail_current_task(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some((task, pb)) = state.current.take() {
                spin_fail(&pb, &task);
            }
        }
    }
}

fn label(tasks: &[String], task: &str) -> String {
    match tasks.iter().position(|t| t == task) {
        Some(i) => format!("[{}/{}] {task}", i + 1, tasks.len()),
        None => task.to_owned(),
    }
}

impl ProgressDisplay for TerminalProgress {
    fn register_tasks(&self, tasks: &[&str]) {
        if let Ok(mut state) = self.state.lock() {
            state.tasks = tasks.iter().map(|t| (*t).to_owned()).collect();
        }
    }

    fn start_task(&self, task: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some((done, pb)) = state.current.take() {
                spin_ok(&pb, &done);
            }
            let text = label(&state.tasks, task);
            state.current = Some((text.clone(), spinner(&text)));
        }
    }

    fn stop_current_task(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some((task, pb)) = state.current.take() {
                spin_ok(&pb, &task);
            }
        }
    }

    fn info_message(&self, message: &str) {
        let line = Style::new().bold().apply_to(message).to_string();
        match self.state.lock() {
            Ok(state) => match &state.current {
                Some((_, pb)) => pb.println(line),
                None => eprintln!("{line}"),
            },
            Err(_) => eprintln!("{line}"),
        }
    }

    fn status_info_message(&self, message: &str) {
        let line = Style::new().dim().apply_to(message).to_string();
        match self.state.lock() {
            Ok(state) => match &state.current {
                Some((task, pb)) => pb.set_message(format!("{task}: {line}")),
                None => eprintln!("{line}"),
            },
            Err(_) => eprintln!("{line}"),
        }
    }
}
