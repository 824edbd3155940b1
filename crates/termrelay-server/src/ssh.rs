//! SSH collaborator: opens remote terminal channels for `ssh` sessions.
//!
//! The relay only needs a duplex byte stream plus resize/terminate control,
//! so the default connector runs the system `ssh` client on a local PTY.
//! Authentication to the remote host is the client binary's business
//! (keys/agent); batch mode keeps it from prompting.

use crate::config::SshProfile;
use crate::session::pty::{open_command, ChannelParts};
use portable_pty::CommandBuilder;
use std::collections::HashMap;
use std::time::Duration;
use termrelay_core::{RelayError, RelayResult, TerminalSize};
use tracing::info;

/// Opens SSH channels on behalf of an owner.
pub trait SshConnector: Send + Sync {
    /// Open a PTY-backed channel for `profile_id`. Blocking.
    fn open_channel(
        &self,
        owner_id: &str,
        profile_id: &str,
        size: TerminalSize,
    ) -> RelayResult<ChannelParts>;

    /// How long a fresh channel is watched for an early exit before it
    /// counts as connected. Zero skips the check.
    fn handshake_window(&self) -> Duration {
        Duration::ZERO
    }
}

/// `ConnectTimeout` passed to the `ssh` client, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connector backed by `[[ssh_profiles]]` and the system `ssh` binary.
pub struct SystemSshConnector {
    program: String,
    profiles: HashMap<String, SshProfile>,
}

impl SystemSshConnector {
    pub fn new(profiles: Vec<SshProfile>) -> Self {
        Self {
            program: "ssh".to_string(),
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Resolve a profile the owner is allowed to use.
    fn profile(&self, owner_id: &str, profile_id: &str) -> RelayResult<&SshProfile> {
        let profile = self
            .profiles
            .get(profile_id)
            .ok_or_else(|| RelayError::SshConnect(format!("unknown ssh profile: {profile_id}")))?;
        if !profile.owners.is_empty() && !profile.owners.iter().any(|o| o == owner_id) {
            return Err(RelayError::SshConnect(format!(
                "ssh profile {profile_id} is not available to this user"
            )));
        }
        Ok(profile)
    }

    /// Arguments passed to `ssh` for a profile.
    fn ssh_args(profile: &SshProfile) -> Vec<String> {
        let mut args = vec![
            "-tt".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
        ];
        if let Some(port) = profile.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        if let Some(identity) = &profile.identity_file {
            args.push("-i".into());
            args.push(crate::config::expand_tilde_str(identity).display().to_string());
        }
        args.extend(profile.extra_args.iter().cloned());
        args.push(match &profile.user {
            Some(user) => format!("{user}@{}", profile.host),
            None => profile.host.clone(),
        });
        args
    }
}

impl SshConnector for SystemSshConnector {
    fn open_channel(
        &self,
        owner_id: &str,
        profile_id: &str,
        size: TerminalSize,
    ) -> RelayResult<ChannelParts> {
        let profile = self.profile(owner_id, profile_id)?;
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(Self::ssh_args(profile));
        cmd.env("TERM", "xterm-256color");

        info!(profile = %profile_id, host = %profile.host, owner = %owner_id, "opening ssh channel");
        open_command(cmd, size).map_err(|e| RelayError::SshConnect(e.to_string()))
    }

    fn handshake_window(&self) -> Duration {
        // The client gives up on its own after the connect timeout.
        Duration::from_secs(CONNECT_TIMEOUT_SECS + 1)
    }
}
