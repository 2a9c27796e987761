use af_daemon::pidfile::PidFile;

use super::Farm;

pub fn run(farm: &Farm) -> anyhow::Result<()> {
    println!("data dir:    {}", farm.data.root().display());
    println!("config:      {}", farm.data.config_file().display());
    println!("state:       {}", farm.data.state_file().display());
    println!("log:         {}", farm.data.log_file().display());
    match PidFile::read_valid(&farm.data.pid_file()) {
        Some(pf) => println!("daemon:      running (pid={}, since {})", pf.pid, pf.started_at),
        None => println!("daemon:      not running"),
    }
    println!();
    print!("{}", farm.config.to_toml()?);
    Ok(())
}
