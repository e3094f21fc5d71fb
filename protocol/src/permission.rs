use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Labels a sensitive command may require. Granted explicitly by the host;
/// never implied by first use.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Display)]
pub enum Permission {
    RepoAnalyze,
    MemoryAccess,
    RemoteAccess,
    CommandExecute,
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RepoAnalyze" => Ok(Permission::RepoAnalyze),
            "MemoryAccess" => Ok(Permission::MemoryAccess),
            "RemoteAccess" => Ok(Permission::RemoteAccess),
            "CommandExecute" => Ok(Permission::CommandExecute),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}
