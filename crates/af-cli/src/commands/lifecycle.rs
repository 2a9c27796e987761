use anyhow::Context;

use super::{with_supervisor, Farm};

/// Hand the terminal to the instance's session until the user detaches.
pub fn attach(farm: &Farm, title: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        let detached = sup.get(title)?.attach()?;
        let _ = detached.recv();
        Ok(())
    })
}

/// Open a shell session rooted in the instance's worktree and attach to it.
pub fn shell(farm: &Farm, title: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        let detached = sup
            .get(title)?
            .open_workspace_shell()
            .with_context(|| format!("failed to open a shell for '{title}'"))?;
        let _ = detached.recv();
        Ok(())
    })
}

pub fn prompt(farm: &Farm, title: &str, text: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        sup.get(title)?.send_prompt(text)?;
        println!("sent prompt to '{title}'");
        Ok(())
    })
}

pub fn pause(farm: &Farm, title: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        let inst = sup.get_mut(title)?;
        inst.pause()
            .with_context(|| format!("failed to pause '{title}'"))?;
        println!("paused '{title}'; work is committed on {}", inst.branch());
        Ok(())
    })
}

pub fn resume(farm: &Farm, title: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        let inst = sup.get_mut(title)?;
        inst.resume()
            .with_context(|| format!("failed to resume '{title}'"))?;
        println!("resumed '{title}' on {}", inst.branch());
        Ok(())
    })
}

pub fn kill(farm: &Farm, title: &str) -> anyhow::Result<()> {
    with_supervisor(farm, |sup| {
        sup.kill(title)
            .with_context(|| format!("failed to kill '{title}'"))?;
        println!("killed '{title}'");
        Ok(())
    })
}
