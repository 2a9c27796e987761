use std::path::Path;

use af_agents::instance::InstanceOptions;
use anyhow::Context;

use super::{with_supervisor, Farm};

/// Run the `new` subcommand: create an instance on a fresh branch and start
/// the configured program in it.
pub fn run(farm: &Farm, repo: &Path, title: &str, prompt: Option<&str>) -> anyhow::Result<()> {
    let opts = InstanceOptions {
        title: title.to_string(),
        repo_path: repo.to_path_buf(),
        program: farm.config.default_program.clone(),
        auto_yes: farm.config.auto_yes,
    };

    with_supervisor(farm, |sup| {
        let inst = sup
            .create(opts, prompt)
            .with_context(|| format!("failed to create instance '{title}'"))?;
        println!(
            "created '{}' on branch {} (session {})",
            inst.title(),
            inst.branch(),
            inst.session_name().unwrap_or("-"),
        );
        Ok(())
    })
}
