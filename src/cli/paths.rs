//! CLI subcommand: `display-sentinel paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use display_sentinel::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("display-sentinel Paths (XDG Base Directory)");
    println!("============================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  device key:     {}", paths.device_key().display());
    println!("  secure storage: {}", paths.secure_storage_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  monitor lock:   {}", paths.monitor_lock().display());

    Ok(())
}
