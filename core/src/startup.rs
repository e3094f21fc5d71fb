use serde_json::Value as JsonValue;
use serde_json::json;

use crate::Result;

/// Registers or removes the worker from the user's autostart entries.
///
/// Windows uses a launcher script in the per-user Startup folder. Other
/// platforms have no equivalent the host relies on, so the call succeeds as
/// a no-op there.
#[cfg(windows)]
pub fn manage_startup(enable: bool) -> Result<JsonValue> {
    use std::fs;
    use std::path::PathBuf;

    let appdata = std::env::var("APPDATA").map_err(|_| {
        crate::CoreErr::InvalidInput("APPDATA is not set; cannot locate Startup folder".into())
    })?;
    let mut shortcut = PathBuf::from(appdata);
    shortcut.extend([
        "Microsoft",
        "Windows",
        "Start Menu",
        "Programs",
        "Startup",
        "nimbus-worker.bat",
    ]);

    if enable {
        let exe = std::env::current_exe()?;
        let script = format!(
            "@echo off\r\ntitle nimbus worker\r\nstart /min \"\" \"{}\"\r\n",
            exe.display()
        );
        fs::write(&shortcut, script)?;
        Ok(json!({"status": "success", "message": "Startup enabled"}))
    } else {
        let _ = fs::remove_file(&shortcut);
        Ok(json!({"status": "success", "message": "Startup disabled"}))
    }
}

#[cfg(not(windows))]
pub fn manage_startup(enable: bool) -> Result<JsonValue> {
    let message = if enable {
        "Startup registration is not supported on this platform"
    } else {
        "Startup disabled"
    };
    Ok(json!({"status": "success", "message": message}))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn non_windows_is_a_successful_no_op() {
        let enabled = manage_startup(true).unwrap();
        assert_eq!(enabled["status"], "success");
        let disabled = manage_startup(false).unwrap();
        assert_eq!(disabled["status"], "success");
    }
}
