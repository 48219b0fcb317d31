// THEORY:
// Settings are layered: the configuration file named on the command line, then
// environment overrides. The file format follows the extension (`.toml`, `.ini`,
// `.yaml`, `.json`), so an existing INI file with `[camera]`, `[detection]`,
// `[movie]`, `[picture]` and `[event]` sections loads unchanged.
//
// Environment overrides use the `SENTRY_` prefix and `__` between section and
// key: `SENTRY_CAMERA__FPS=15` overrides `camera.fps`.
//
// The result is validated here, so a bad value stops the daemon before any
// device is opened.

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File};
use motion_sentry::SentryConfig;
use std::path::Path;

pub const ENV_PREFIX: &str = "SENTRY";

pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Loads `path` with overrides from the process environment.
pub fn load(path: &Path) -> Result<SentryConfig> {
    load_with(path, environment())
}

pub fn load_with(path: &Path, overrides: Environment) -> Result<SentryConfig> {
    if !path.is_file() {
        bail!("configuration file {} does not exist", path.display());
    }

    let settings = Config::builder()
        .add_source(File::from(path))
        .add_source(overrides)
        .build()
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: SentryConfig = settings
        .try_deserialize()
        .with_context(|| format!("malformed configuration in {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn no_overrides() -> Environment {
        environment().source(Some(config::Map::new()))
    }

    #[test]
    fn toml_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "sentry.toml",
            r#"
                [camera]
                device = "/dev/video2"
                fps = 15

                [detection]
                min_area = 800
                max_area = 20000

                [event]
                on_event_start = "notify {event_id}"
            "#,
        );

        let config = load_with(&path, no_overrides()).unwrap();
        assert_eq!(config.camera.device, "/dev/video2");
        assert_eq!(config.camera.fps, 15.0);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.detection.min_area, 800);
        assert_eq!(config.detection.max_area, Some(20000));
        assert_eq!(config.event.on_event_start, "notify {event_id}");
        assert_eq!(config.event.no_motion_timeout, 20.0);
    }

    #[test]
    fn ini_files_load_with_their_section_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "motion.ini",
            "[camera]\nwidth = 320\nheight = 240\n\n[movie]\ndirpath = /srv/movies\nmax_duration = 120\n\n[picture]\ndirpath = /srv/pictures\n",
        );

        let config = load_with(&path, no_overrides()).unwrap();
        assert_eq!((config.camera.width, config.camera.height), (320, 240));
        assert_eq!(config.movie.dirpath, PathBuf::from("/srv/movies"));
        assert_eq!(config.movie.max_record_seconds, 120.0);
        assert_eq!(config.picture.dirpath, PathBuf::from("/srv/pictures"));
    }

    #[test]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "sentry.toml", "[event]\nevent_gap = 10\n");

        let mut vars = config::Map::new();
        vars.insert("SENTRY_EVENT__EVENT_GAP".to_string(), "45".to_string());
        vars.insert("SENTRY_LOG__LEVEL".to_string(), "debug".to_string());
        let config = load_with(&path, environment().source(Some(vars))).unwrap();

        assert_eq!(config.event.event_gap, 45.0);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn invalid_values_are_rejected_with_the_field_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "sentry.toml", "[camera]\nfps = 0\n");

        let err = load_with(&path, no_overrides()).unwrap_err();
        assert!(format!("{err:#}").contains("camera.fps"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_with(&dir.path().join("absent.toml"), no_overrides()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
