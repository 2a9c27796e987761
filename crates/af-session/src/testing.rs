//! In-memory stand-in for the tmux server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use af_core::runner::{SpawnError, ToolOutput};

use crate::tmux::{Result, TmuxRunner};

/// Fake tmux that tracks live sessions and their screens, and records argv.
#[derive(Default)]
pub struct FakeTmux {
    sessions: Mutex<BTreeSet<String>>,
    screens: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<Vec<String>>>,
    attached: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    missing: AtomicBool,
    no_server: AtomicBool,
}

impl FakeTmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a session already exists (e.g. it survived a restart).
    pub fn add_session(&self, name: &str) {
        self.sessions.lock().unwrap().insert(name.to_string());
    }

    /// Make a session disappear without a `kill-session` call.
    pub fn remove_session(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        self.sessions.lock().unwrap().contains(name)
    }

    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().iter().cloned().collect()
    }

    /// Content returned by `capture-pane` for `name`.
    pub fn set_screen(&self, name: &str, text: &str) {
        self.screens
            .lock()
            .unwrap()
            .insert(name.to_string(), text.to_string());
    }

    /// Behave as if the tmux binary were not installed.
    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    /// Make every `command` invocation (e.g. `"send-keys"`) exit non-zero.
    pub fn fail_command(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    /// Undo [`fail_command`](Self::fail_command).
    pub fn heal_command(&self, command: &str) {
        self.failing.lock().unwrap().remove(command);
    }

    /// Behave as if no tmux server were running.
    pub fn set_no_server(&self, no_server: bool) {
        self.no_server.store(no_server, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn find(&self, prefix: &[&str]) -> Option<Vec<String>> {
        self.calls()
            .into_iter()
            .find(|argv| starts_with(argv, prefix))
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|argv| starts_with(argv, prefix))
            .count()
    }

    /// Key sequences sent to `name` with `send-keys` (literal sends included).
    pub fn keys_sent(&self, name: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(String::as_str) == Some("send-keys"))
            .filter(|argv| target(argv).as_deref() == Some(name))
            .map(|argv| {
                argv.into_iter()
                    .skip(1)
                    .filter(|a| a != "-t" && a != "-l" && a != name)
                    .collect()
            })
            .collect()
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }

    fn handle(&self, argv: &[String]) -> ToolOutput {
        let Some(cmd) = argv.first() else {
            return ToolOutput::ok("");
        };
        if self.failing.lock().unwrap().contains(cmd) {
            return ToolOutput::failed(format!("{cmd}: server exited unexpectedly"));
        }
        let name = target(argv);
        let exists = |n: &Option<String>| n.as_ref().is_some_and(|n| self.has(n));

        match cmd.as_str() {
            "has-session" => {
                if exists(&name) {
                    ToolOutput::ok("")
                } else {
                    ToolOutput::failed("can't find session")
                }
            }
            "new-session" => {
                let Some(name) = flag_value(argv, "-s") else {
                    return ToolOutput::failed("missing -s");
                };
                let mut sessions = self.sessions.lock().unwrap();
                if sessions.insert(name.clone()) {
                    ToolOutput::ok("")
                } else {
                    ToolOutput::failed(format!("duplicate session: {name}"))
                }
            }
            "kill-session" => match name {
                Some(n) if self.sessions.lock().unwrap().remove(&n) => ToolOutput::ok(""),
                _ => ToolOutput::failed("can't find session"),
            },
            "capture-pane" => match name {
                Some(n) if self.has(&n) => {
                    let screen = self.screens.lock().unwrap().get(&n).cloned();
                    ToolOutput::ok(screen.unwrap_or_default())
                }
                _ => ToolOutput::failed("can't find pane"),
            },
            "send-keys" | "set-option" => {
                if exists(&name) {
                    ToolOutput::ok("")
                } else {
                    ToolOutput::failed("can't find session")
                }
            }
            "list-sessions" => {
                if self.no_server.load(Ordering::SeqCst) {
                    return ToolOutput::failed("no server running on /tmp/tmux-1000/default");
                }
                ToolOutput::ok(self.sessions().join("\n"))
            }
            _ => ToolOutput::ok(""),
        }
    }
}

impl TmuxRunner for FakeTmux {
    fn run(&self, args: &[&str]) -> std::result::Result<ToolOutput, SpawnError> {
        if self.missing.load(Ordering::SeqCst) {
            return Err(SpawnError::NotInstalled("tmux".into()));
        }
        let argv: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.calls.lock().unwrap().push(argv.clone());
        Ok(self.handle(&argv))
    }

    fn attach(&self, name: &str) -> Result<()> {
        self.attached.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

fn starts_with(argv: &[String], prefix: &[&str]) -> bool {
    argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
}

fn flag_value(argv: &[String], flag: &str) -> Option<String> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .cloned()
}

/// Session addressed by `-t name` or `-t=name`.
fn target(argv: &[String]) -> Option<String> {
    if let Some(t) = argv.iter().find_map(|a| a.strip_prefix("-t=")) {
        return Some(t.to_string());
    }
    flag_value(argv, "-t")
}
