//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `check`  | `Check`          |
//! | `render` | `Render`         |

pub mod check;
pub mod render;
pub mod serve;

pub use check::cmd_check;
pub use render::cmd_render;
pub use serve::cmd_serve;

use anyhow::Result;
use onboard::config::ServiceConfig;

use crate::Cli;

/// File, then environment. Command-specific flags are applied by the caller.
pub(crate) fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env();
    Ok(config)
}
