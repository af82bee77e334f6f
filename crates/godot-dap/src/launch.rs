//! Launch configuration for the Godot editor and `res://` path translation.
//!
//! Godot's `launch` request takes a custom argument map rather than the
//! generic DAP shape. [`LaunchConfig`] builds that map and validates the
//! project directory up front, so a bad path fails locally instead of as an
//! opaque adapter error mid-handshake.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use thiserror::Error;

/// Which scene the editor should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneMode {
    /// The project's configured main scene.
    #[default]
    Main,
    /// Whatever scene is open in the editor.
    Current,
    /// A specific scene file, named by [`LaunchConfig::scene_path`].
    Custom,
}

/// Target platform for the launched game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Host,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Host => "host",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchConfigError {
    #[error("project directory is not set")]
    MissingProject,

    #[error("project.godot not found in {}", .path.display())]
    ProjectFileMissing { path: PathBuf },

    #[error("scene mode is custom but no scene path is set")]
    MissingScenePath,

    #[error("source path is empty")]
    EmptySourcePath,

    #[error("cannot resolve {0}: no project root configured")]
    UnresolvedResPath(String),

    #[error("source path {0} is relative; breakpoint paths must be absolute")]
    RelativeSourcePath(String),
}

/// Arguments for launching a Godot project under the debugger.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Project directory (the one containing `project.godot`).
    pub project: PathBuf,
    pub scene: SceneMode,
    /// `res://` or absolute scene path; required for [`SceneMode::Custom`].
    pub scene_path: Option<String>,
    pub platform: Platform,
    /// Run without hitting breakpoints.
    pub no_debug: bool,
    pub profiling: bool,
    pub debug_collisions: bool,
    pub debug_paths: bool,
    pub debug_navigation: bool,
    /// Extra command-line options passed to the game process verbatim.
    pub additional_options: Option<String>,
}

impl LaunchConfig {
    pub fn new(project: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            scene: SceneMode::Main,
            scene_path: None,
            platform: Platform::Host,
            no_debug: false,
            profiling: false,
            debug_collisions: false,
            debug_paths: false,
            debug_navigation: false,
            additional_options: None,
        }
    }

    /// Checks that the configuration names a real Godot project and is
    /// internally consistent.
    pub fn validate(&self) -> Result<(), LaunchConfigError> {
        if self.project.as_os_str().is_empty() {
            return Err(LaunchConfigError::MissingProject);
        }
        if !self.project.join("project.godot").is_file() {
            return Err(LaunchConfigError::ProjectFileMissing {
                path: self.project.clone(),
            });
        }
        if self.scene == SceneMode::Custom && self.scene_path.is_none() {
            return Err(LaunchConfigError::MissingScenePath);
        }
        Ok(())
    }

    /// Builds the argument map Godot's adapter expects for `launch`.
    pub fn to_launch_args(&self) -> Value {
        let scene = match self.scene {
            SceneMode::Main => "main".to_string(),
            SceneMode::Current => "current".to_string(),
            SceneMode::Custom => self.scene_path.clone().unwrap_or_default(),
        };

        let mut args = json!({
            "project": self.project.to_string_lossy(),
            "scene": scene,
            "platform": self.platform.as_str(),
            "noDebug": self.no_debug,
            "profiling": self.profiling,
            "debug_collisions": self.debug_collisions,
            "debug_paths": self.debug_paths,
            "debug_navigation": self.debug_navigation,
        });
        if let Some(options) = &self.additional_options {
            args["additional_options"] = Value::String(options.clone());
        }
        args
    }
}

/// Translates a script path into the absolute host path `setBreakpoints`
/// needs.
///
/// `res://` paths resolve against `project_root`. Absolute paths pass
/// through untouched. Relative paths are rejected rather than guessed
/// against the process working directory.
pub fn resolve_source_path(
    path: &str,
    project_root: Option<&Path>,
) -> Result<PathBuf, LaunchConfigError> {
    if path.is_empty() {
        return Err(LaunchConfigError::EmptySourcePath);
    }

    if let Some(resource) = path.strip_prefix("res://") {
        let Some(root) = project_root else {
            return Err(LaunchConfigError::UnresolvedResPath(path.to_string()));
        };
        return Ok(root.join(resource));
    }

    let as_path = Path::new(path);
    if as_path.is_absolute() {
        Ok(as_path.to_path_buf())
    } else {
        Err(LaunchConfigError::RelativeSourcePath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("project.godot"), "config_version=5\n").unwrap();
        dir
    }

    #[test]
    fn validate_accepts_a_real_project() {
        let dir = project_dir();
        assert_eq!(LaunchConfig::new(dir.path()).validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_an_empty_project_path() {
        assert_eq!(
            LaunchConfig::new("").validate(),
            Err(LaunchConfigError::MissingProject)
        );
    }

    #[test]
    fn validate_rejects_a_directory_without_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LaunchConfig::new(dir.path()).validate().unwrap_err();
        assert!(matches!(err, LaunchConfigError::ProjectFileMissing { .. }));
    }

    #[test]
    fn validate_requires_a_scene_path_for_custom_scenes() {
        let dir = project_dir();
        let mut config = LaunchConfig::new(dir.path());
        config.scene = SceneMode::Custom;
        assert_eq!(
            config.validate(),
            Err(LaunchConfigError::MissingScenePath)
        );

        config.scene_path = Some("res://levels/one.tscn".to_string());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn launch_args_cover_every_field() {
        let mut config = LaunchConfig::new("/projects/game");
        config.scene = SceneMode::Custom;
        config.scene_path = Some("res://levels/one.tscn".to_string());
        config.profiling = true;
        config.debug_collisions = true;
        config.additional_options = Some("--fixed-fps 30".to_string());

        let args = config.to_launch_args();
        assert_eq!(args["project"], "/projects/game");
        assert_eq!(args["scene"], "res://levels/one.tscn");
        assert_eq!(args["platform"], "host");
        assert_eq!(args["noDebug"], false);
        assert_eq!(args["profiling"], true);
        assert_eq!(args["debug_collisions"], true);
        assert_eq!(args["debug_paths"], false);
        assert_eq!(args["additional_options"], "--fixed-fps 30");
    }

    #[test]
    fn scene_modes_map_to_their_keywords() {
        let mut config = LaunchConfig::new("/projects/game");
        assert_eq!(config.to_launch_args()["scene"], "main");
        config.scene = SceneMode::Current;
        assert_eq!(config.to_launch_args()["scene"], "current");
    }

    #[test]
    fn res_paths_resolve_against_the_project_root() {
        let resolved =
            resolve_source_path("res://scripts/player.gd", Some(Path::new("/projects/game")))
                .unwrap();
        assert_eq!(resolved, PathBuf::from("/projects/game/scripts/player.gd"));
    }

    #[test]
    fn res_paths_without_a_root_are_rejected() {
        let err = resolve_source_path("res://scripts/player.gd", None).unwrap_err();
        assert!(matches!(err, LaunchConfigError::UnresolvedResPath(_)));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let resolved = resolve_source_path("/projects/game/scripts/player.gd", None).unwrap();
        assert_eq!(
            resolved,
            PathBuf::from("/projects/game/scripts/player.gd")
        );
    }

    #[test]
    fn relative_paths_are_rejected() {
        let err = resolve_source_path("scripts/player.gd", Some(Path::new("/p"))).unwrap_err();
        assert!(matches!(err, LaunchConfigError::RelativeSourcePath(_)));
    }

    #[test]
    fn empty_paths_are_rejected() {
        assert_eq!(
            resolve_source_path("", None),
            Err(LaunchConfigError::EmptySourcePath)
        );
    }
}
