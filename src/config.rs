//! Session configuration assembled from CLI flags.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::codec::CompressionMode;

/// How the session locates its application: oneshot hands a socketpair fd
/// directly to a single spawned app; display mode binds a named listening
/// socket that any number of applications can connect to over the life of
/// the supervisor.
#[derive(Debug, Clone)]
pub enum SessionMode {
    Oneshot,
    Display { name: String },
}

/// Everything the session supervisor needs to run one proxy session,
/// equivalent in role to the teacher's `Config` minus anything
/// serialization- or keyring-related.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Filesystem path of the channel endpoint this proxy connects to
    /// — typically a socket bridged over TCP/SSH to the peer.
    pub channel_socket: PathBuf,
    /// Session mode.
    pub mode: SessionMode,
    /// Control FIFO path for reconnection; `None` disables
    /// reconnection support entirely (the token's `RECONNECTABLE` bit is
    /// then unset).
    pub control_fifo: Option<PathBuf>,
    /// Compression mode applied to bulk transfers.
    pub codec: CompressionMode,
    /// Worker threads for the source-side pool.
    pub source_threads: usize,
    /// Worker threads for the sink-side pool.
    pub sink_threads: usize,
    /// Whether a forked shell (absent an explicit app argv) should be a
    /// login shell.
    pub login_shell: bool,
    /// The application to launch and its arguments; empty means "fall back
    /// to `$SHELL`".
    pub app_argv: Vec<String>,
}

impl SessionConfig {
    /// Number of worker threads to default to when `--threads` isn't given:
    /// the platform's available parallelism, falling back to 1 if that
    /// can't be determined.
    #[must_use]
    pub fn default_thread_count() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Validates cross-field invariants that `clap` itself can't express:
    /// oneshot mode needs no display name, display mode needs one.
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            SessionMode::Oneshot => {
                if !self.app_argv.is_empty() && self.app_argv[0].is_empty() {
                    bail!("application argv must not contain an empty program name");
                }
            }
            SessionMode::Display { name } => {
                if name.is_empty() {
                    bail!("--display requires a non-empty socket name");
                }
            }
        }
        if !self.channel_socket.as_os_str().is_empty() {
            // Nothing further to validate here; existence is checked at
            // connect time.
        } else {
            bail!("--socket requires a path");
        }
        Ok(())
    }
}

/// Parses the `server` subcommand's flags (as collected by `main.rs`'s
/// `clap` derive) into a [`SessionConfig`].
pub struct RawServerArgs {
    pub oneshot: bool,
    pub display: Option<String>,
    pub socket: PathBuf,
    pub control: Option<PathBuf>,
    pub login_shell: bool,
    pub codec: String,
    pub codec_level: Option<i32>,
    pub threads: Option<usize>,
    pub app_argv: Vec<String>,
}

impl TryFrom<RawServerArgs> for SessionConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawServerArgs) -> Result<Self> {
        let mode = if raw.oneshot {
            if raw.display.is_some() {
                bail!("--display is incompatible with --oneshot");
            }
            SessionMode::Oneshot
        } else {
            let name = raw
                .display
                .context("--display is required unless --oneshot is given")?;
            SessionMode::Display { name }
        };

        let codec = CompressionMode::parse(&raw.codec, raw.codec_level)?;
        let threads = raw.threads.unwrap_or_else(SessionConfig::default_thread_count);

        let config = SessionConfig {
            channel_socket: raw.socket,
            mode,
            control_fifo: raw.control,
            codec,
            source_threads: threads,
            sink_threads: threads,
            login_shell: raw.login_shell,
            app_argv: raw.app_argv,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(oneshot: bool, display: Option<&str>) -> RawServerArgs {
        RawServerArgs {
            oneshot,
            display: display.map(str::to_string),
            socket: PathBuf::from("/tmp/shadowlink-test.sock"),
            control: None,
            login_shell: false,
            codec: "lz4".to_string(),
            codec_level: None,
            threads: Some(2),
            app_argv: vec![],
        }
    }

    #[test]
    fn oneshot_without_display_is_valid() {
        let config = SessionConfig::try_from(raw(true, None)).unwrap();
        assert!(matches!(config.mode, SessionMode::Oneshot));
    }

    #[test]
    fn oneshot_with_display_is_rejected() {
        assert!(SessionConfig::try_from(raw(true, Some("wayland-1"))).is_err());
    }

    #[test]
    fn display_mode_requires_a_name() {
        assert!(SessionConfig::try_from(raw(false, None)).is_err());
        let config = SessionConfig::try_from(raw(false, Some("wayland-1"))).unwrap();
        assert!(matches!(config.mode, SessionMode::Display { name } if name == "wayland-1"));
    }

    #[test]
    fn default_thread_count_is_at_least_one() {
        assert!(SessionConfig::default_thread_count() >= 1);
    }
}
