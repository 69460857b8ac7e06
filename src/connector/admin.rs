//! Commands addressed to the connector itself (`app` messages).
//!
//! Everything except `ping` requires the caller to present `remoteConfigurationKey`.

use serde_json::Value;
use std::{
    io::{Cursor, Read},
    path::Path,
    process::Stdio,
    sync::Arc,
};
use subtle::ConstantTimeEq;
use tether_schema::AdminRequest;
use tether_sqlcore::decode_buffer;
use tokio::process::Command;
use tracing::{info, warn};

use super::ConnectorHandle;
use crate::config::{BasicConfig, ConfigSource};
use crate::error::TetherError;

/// What an administrative command needs from the connector at resolution time.
#[derive(Clone)]
pub(crate) struct AdminContext {
    pub remote_configuration_key: Option<String>,
    pub settings: Arc<BasicConfig>,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

impl AdminContext {
    /// Checks the `key` member of `credentials` against the configured key.
    fn authorize(&self, action: &'static str, credentials: Option<&Value>) -> Result<(), TetherError> {
        let Some(expected) = self.remote_configuration_key.as_deref() else {
            return Err(TetherError::NotAllowed(action));
        };
        let provided = credentials
            .and_then(|c| c.get("key"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(TetherError::WrongKey)
        }
    }
}

pub(crate) async fn handle(
    connector: &ConnectorHandle,
    ctx: &AdminContext,
    msg: &Value,
) -> Result<Option<Value>, TetherError> {
    let request: AdminRequest = serde_json::from_value(msg.clone())?;
    match request.cmd.as_str() {
        "restart" => {
            ctx.authorize("Restart", request.args.first())?;
            restart(&ctx.settings).await?;
        }
        "changeConfig" => {
            ctx.authorize("Change of config", request.args.get(1))?;
            let document = request.args.first().cloned().ok_or_else(|| {
                TetherError::InvalidRequest("changeConfig: missing configuration".to_string())
            })?;
            connector.load_config(ConfigSource::Inline(document)).await?;
        }
        "changeCode" => {
            let options = request.args.get(1);
            ctx.authorize("Change of source code", options)?;
            let archive = request
                .args
                .first()
                .and_then(decode_buffer)
                .ok_or_else(|| TetherError::InvalidRequest("changeCode: missing archive".to_string()))?;
            change_code(&ctx.settings, archive).await?;
            let wants_restart = options
                .and_then(|o| o.get("restart"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if wants_restart {
                restart(&ctx.settings).await?;
            }
        }
        "ping" => {}
        other => return Err(TetherError::UnknownCommand(other.to_string())),
    }
    Ok(None)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), TetherError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

fn script_command(script: &Path) -> Command {
    if cfg!(windows) {
        Command::new(script)
    } else {
        let mut command = Command::new("bash");
        command.arg("-c").arg(script);
        command
    }
}

/// Launches the restart script detached and returns without waiting for it.
async fn restart(settings: &BasicConfig) -> Result<(), TetherError> {
    let script = settings.install_path(&settings.restart_script);
    #[cfg(unix)]
    make_executable(&script).await?;

    let child = script_command(&script)
        .current_dir(&settings.install_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    info!(script = %script.display(), pid = child.id().unwrap_or_default(), "Restart launched");
    Ok(())
}

/// Unpacks a (possibly gzip-compressed) tar archive over the installation directory and runs
/// the update script, which must succeed.
async fn change_code(settings: &BasicConfig, archive: Vec<u8>) -> Result<(), TetherError> {
    let target = settings.install_dir.clone();
    let entries = tokio::task::spawn_blocking(move || unpack(&archive, &target))
        .await
        .map_err(|e| TetherError::UnexpectedError(format!("Unpack worker failed: {e}")))??;
    info!(entries, dir = %settings.install_dir.display(), "Code archive unpacked");

    let script = settings.install_path(&settings.update_script);
    #[cfg(unix)]
    make_executable(&script).await?;

    let output = script_command(&script)
        .current_dir(&settings.install_dir)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(script = %script.display(), status = %output.status, stderr = %stderr.trim(), "Update script failed");
        return Err(TetherError::UnexpectedError(format!(
            "Update script failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

fn unpack(archive: &[u8], target: &Path) -> Result<usize, TetherError> {
    let reader: Box<dyn Read> = if archive.starts_with(&GZIP_MAGIC) {
        Box::new(flate2::read::GzDecoder::new(Cursor::new(archive)))
    } else {
        Box::new(Cursor::new(archive))
    };
    let mut tar = tar::Archive::new(reader);
    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        entry.unpack_in(target)?;
        count += 1;
    }
    Ok(count)
}
