use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Handle to one agent workspace: a linked git worktree bound to a branch.
///
/// The handle is plain data so it can be persisted and rebuilt; all git
/// operations on it go through [`crate::worktree_manager::WorkspaceManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    /// Root of the main repository the worktree belongs to.
    pub repo_path: PathBuf,
    /// Directory of the linked worktree.
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Commit the workspace branched from. Diffs are measured against its
    /// merge-base with HEAD.
    pub base_commit: String,
}

impl Worktree {
    /// Whether the worktree directory is currently present on disk.
    pub fn exists_on_disk(&self) -> bool {
        self.worktree_path.is_dir()
    }
}

/// Line counts of a workspace's changes relative to its base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    /// Raw unified diff. Not persisted.
    #[serde(skip)]
    pub content: String,
}

impl DiffStats {
    /// Count `+`/`-` lines of a unified diff, ignoring the file headers.
    pub fn parse(diff: &str) -> Self {
        let mut stats = DiffStats {
            content: diff.to_string(),
            ..Default::default()
        };
        for line in diff.lines() {
            if line.starts_with("+++") || line.starts_with("---") {
                continue;
            }
            if line.starts_with('+') {
                stats.added += 1;
            } else if line.starts_with('-') {
                stats.removed += 1;
            }
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Turn free text into a valid git branch name.
///
/// Lowercases, maps spaces to `-`, drops anything outside
/// `[a-z0-9-_/.]`, collapses runs of `-`, and trims `-` and `/` from both ends.
pub fn sanitize_branch_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_/.".contains(*c))
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed.trim_matches(|c| c == '-' || c == '/').to_string()
}

/// Directory name for a new worktree: `<branch with '/' flattened>_<hex nanos>`.
pub(crate) fn worktree_dir_name(branch: &str, nanos: u128) -> String {
    let flat: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{flat}_{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_branch_name_rules() {
        assert_eq!(sanitize_branch_name("My Cool Feature!"), "my-cool-feature");
        assert_eq!(sanitize_branch_name("alice/fix  the   bug"), "alice/fix-the-bug");
        assert_eq!(sanitize_branch_name("--/edge/--"), "edge");
        assert_eq!(sanitize_branch_name("v1.2_rc"), "v1.2_rc");
        assert_eq!(sanitize_branch_name("émoji 🚀 task"), "moji-task");
    }

    #[test]
    fn worktree_dir_name_is_flat() {
        assert_eq!(worktree_dir_name("alice/feat", 255), "alice-feat_ff");
    }

    #[test]
    fn diff_stats_skip_headers() {
        let diff = "\
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
@@ -1,2 +1,3 @@
-old
+new
+another
 context
";
        let stats = DiffStats::parse(diff);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 1);
        assert!(!stats.is_empty());
        assert!(DiffStats::parse("").is_empty());
    }
}
