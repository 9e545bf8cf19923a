//! Launch options consumed by the process launcher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Which default arguments the launcher should use when assembling the
/// engine command line. The three modes are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IgnoreDefaultArgs {
    /// Use the engine's computed default arguments unmodified.
    #[default]
    UseDefaults,
    /// Ignore all defaults; use only caller-supplied arguments, verbatim.
    All,
    /// Use defaults minus this exclusion list.
    These(Vec<String>),
}

/// Parameters for launching an external engine process.
///
/// Pure data; the behavioral extension points (test hooks, graceful-close
/// operation) are passed to the launcher separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchOptions {
    /// Explicit executable path. When absent, the engine's bundled default
    /// is used and failure messages suggest reinstalling.
    pub executable_path: Option<PathBuf>,
    /// Caller-supplied arguments, merged with the engine's defaults.
    pub args: Vec<String>,
    /// Default-argument override mode.
    pub ignore_default_args: IgnoreDefaultArgs,
    /// Environment overrides. `None` inherits the parent environment.
    pub env: Option<HashMap<String, String>>,
    /// Forward SIGINT to the engine process.
    pub handle_sigint: bool,
    /// Forward SIGTERM to the engine process.
    pub handle_sigterm: bool,
    /// Forward SIGHUP to the engine process.
    pub handle_sighup: bool,
    /// Establish the transport via a socket handshake instead of stdio pipes.
    /// The engine is expected to announce its listening address on stderr.
    pub use_web_socket: bool,
    /// Downloads directory. A temporary directory owned by the launch is
    /// created when absent.
    pub downloads_path: Option<PathBuf>,
    /// User-data directory. A temporary directory owned by the launch is
    /// created when absent.
    pub user_data_dir: Option<PathBuf>,
    /// Launch deadline in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable_path: None,
            args: Vec::new(),
            ignore_default_args: IgnoreDefaultArgs::UseDefaults,
            env: None,
            handle_sigint: true,
            handle_sigterm: true,
            handle_sighup: true,
            use_web_socket: false,
            downloads_path: None,
            user_data_dir: None,
            timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_handle_all_signals_over_pipe() {
        let options = LaunchOptions::default();
        assert!(options.handle_sigint);
        assert!(options.handle_sigterm);
        assert!(options.handle_sighup);
        assert!(!options.use_web_socket);
        assert_eq!(options.ignore_default_args, IgnoreDefaultArgs::UseDefaults);
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let options: LaunchOptions = serde_json::from_str(r#"{"args": ["--headless"]}"#).unwrap();
        assert_eq!(options.args, vec!["--headless".to_string()]);
        assert!(options.handle_sigterm);
        assert!(options.executable_path.is_none());
    }

    #[test]
    fn exclusion_list_mode_round_trips() {
        let options = LaunchOptions {
            ignore_default_args: IgnoreDefaultArgs::These(vec!["--mute-audio".to_string()]),
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: LaunchOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ignore_default_args, options.ignore_default_args);
    }
}
