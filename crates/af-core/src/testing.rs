//! Scripted fakes for the external-tool runners.
//!
//! Responses are keyed by argv prefix; the most recently registered matching
//! rule wins, and unmatched invocations succeed with empty output. One-shot
//! responses are consumed before standing rules are consulted.
//!
//! Successful `worktree add` and `worktree remove` invocations create and
//! delete the worktree directory, so code that checks the filesystem sees
//! the same layout real git would leave behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::runner::{GitRunner, PublishRunner, SpawnError, ToolOutput};

#[derive(Default)]
struct Script {
    rules: Mutex<Vec<(Vec<String>, ToolOutput)>>,
    once: Mutex<Vec<(Vec<String>, ToolOutput)>>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Script {
    fn invoke(&self, dir: &Path, args: &[&str]) -> ToolOutput {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let argv: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.calls
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), argv.clone()));

        if let Some(delay) = *self.delay.lock().unwrap() {
            std::thread::sleep(delay);
        }

        let out = self.lookup(&argv);
        if out.success {
            apply_worktree_side_effects(&argv);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn lookup(&self, argv: &[String]) -> ToolOutput {
        {
            let mut once = self.once.lock().unwrap();
            if let Some(pos) = once.iter().position(|(p, _)| argv.starts_with(p)) {
                return once.remove(pos).1;
            }
        }
        self.rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| argv.starts_with(prefix))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| ToolOutput::ok(""))
    }

    fn respond(&self, prefix: &[&str], out: ToolOutput) {
        self.rules.lock().unwrap().push((to_vec(prefix), out));
    }

    fn respond_once(&self, prefix: &[&str], out: ToolOutput) {
        self.once.lock().unwrap().push((to_vec(prefix), out));
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, argv)| argv.clone())
            .collect()
    }

    fn calls_in(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

fn apply_worktree_side_effects(argv: &[String]) {
    match argv {
        [wt, add, rest @ ..] if wt == "worktree" && add == "add" => {
            let path = match rest {
                [flag, _branch, path, ..] if flag == "-b" => Some(path),
                [path, ..] => Some(path),
                [] => None,
            };
            if let Some(path) = path {
                let _ = std::fs::create_dir_all(path);
            }
        }
        [wt, remove, .., path] if wt == "worktree" && remove == "remove" => {
            let _ = std::fs::remove_dir_all(path);
        }
        _ => {}
    }
}

fn to_vec(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

macro_rules! fake_runner {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Default)]
        pub struct $name {
            script: Script,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            /// Standing response for every invocation whose argv starts with `prefix`.
            pub fn respond(&self, prefix: &[&str], out: ToolOutput) {
                self.script.respond(prefix, out);
            }

            /// Response consumed by the next matching invocation only.
            pub fn respond_once(&self, prefix: &[&str], out: ToolOutput) {
                self.script.respond_once(prefix, out);
            }

            /// Sleep inside every invocation, widening overlap windows.
            pub fn set_delay(&self, delay: Duration) {
                *self.script.delay.lock().unwrap() = Some(delay);
            }

            /// Argv of every invocation, in order.
            pub fn calls(&self) -> Vec<Vec<String>> {
                self.script.calls()
            }

            pub fn clear_calls(&self) {
                self.script.calls.lock().unwrap().clear();
            }

            /// Directory and argv of every invocation, in order.
            pub fn calls_in(&self) -> Vec<(PathBuf, Vec<String>)> {
                self.script.calls_in()
            }

            /// First invocation whose argv starts with `prefix`.
            pub fn find(&self, prefix: &[&str]) -> Option<Vec<String>> {
                let prefix = to_vec(prefix);
                self.calls().into_iter().find(|argv| argv.starts_with(&prefix))
            }

            pub fn count(&self, prefix: &[&str]) -> usize {
                let prefix = to_vec(prefix);
                self.calls()
                    .iter()
                    .filter(|argv| argv.starts_with(&prefix))
                    .count()
            }

            /// Highest number of invocations observed running at once.
            pub fn max_in_flight(&self) -> usize {
                self.script.max_in_flight.load(Ordering::SeqCst)
            }
        }
    };
}

fake_runner!(FakeGit, "Recording fake for [`GitRunner`].");
fake_runner!(FakeGh, "Recording fake for [`PublishRunner`].");

impl GitRunner for FakeGit {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError> {
        Ok(self.script.invoke(dir, args))
    }
}

impl PublishRunner for FakeGh {
    fn run_gh(&self, dir: &Path, args: &[&str]) -> Result<ToolOutput, SpawnError> {
        Ok(self.script.invoke(dir, args))
    }
}
