use std::path::PathBuf;

use anyhow::Context;

/// Gateway home: `--home` / `CC_GW_HOME`, else `$HOME/.cc-gw`.
pub(crate) fn resolve(cli_value: Option<&std::path::Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = cli_value {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir().context("cannot determine the home directory")?;
    Ok(home.join(".cc-gw"))
}
