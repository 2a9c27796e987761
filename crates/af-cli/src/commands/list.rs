use af_agents::instance::Instance;
use af_agents::state_machine::InstanceStatus;
use af_agents::storage::InstanceRecord;
use anyhow::Context;

use super::Farm;

/// One line of the status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub title: String,
    pub branch: String,
    pub status: InstanceStatus,
    pub added: usize,
    pub removed: usize,
    /// A prompt is waiting for a human.
    pub waiting: bool,
}

impl Row {
    pub fn from_record(record: &InstanceRecord) -> Self {
        Self {
            title: record.title.clone(),
            branch: record.branch.clone(),
            status: record.status,
            added: record.diff_stats.added,
            removed: record.diff_stats.removed,
            waiting: false,
        }
    }

    pub fn from_instance(inst: &Instance) -> Self {
        Self {
            title: inst.title().to_string(),
            branch: inst.branch().to_string(),
            status: inst.status(),
            added: inst.diff_stats().added,
            removed: inst.diff_stats().removed,
            waiting: inst.prompt_pending(),
        }
    }
}

/// Render rows as an aligned table.
pub fn render(rows: &[Row]) -> String {
    if rows.is_empty() {
        return "no instances (create one with `af new <title>`)\n".to_string();
    }

    let title_w = rows.iter().map(|r| r.title.len()).max().unwrap_or(0).max(5);
    let branch_w = rows.iter().map(|r| r.branch.len()).max().unwrap_or(0).max(6);

    let mut out = format!(
        "{:<title_w$}  {:<branch_w$}  {:<8}  DIFF\n",
        "TITLE", "BRANCH", "STATUS"
    );
    for r in rows {
        let status = if r.waiting {
            format!("{}*", r.status)
        } else {
            r.status.to_string()
        };
        out.push_str(&format!(
            "{:<title_w$}  {:<branch_w$}  {:<8}  +{} -{}\n",
            r.title, r.branch, status, r.added, r.removed
        ));
    }
    if rows.iter().any(|r| r.waiting) {
        out.push_str("* waiting for approval\n");
    }
    out
}

/// Run the `list` subcommand from the persisted state, without touching
/// sessions or worktrees.
pub fn run(farm: &Farm, json: bool) -> anyhow::Result<()> {
    let records = farm.store().load().context("failed to read instances")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    let rows: Vec<Row> = records.iter().map(Row::from_record).collect();
    print!("{}", render(&rows));
    Ok(())
}
